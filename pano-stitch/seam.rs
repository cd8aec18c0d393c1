//! Seam finders: decide, inside every overlap, which image owns each pixel.
//!
//! All finders take the warped float images, their canvas corners and
//! masks, and return refined copies of the masks.

use std::collections::VecDeque;

use image::{GrayImage, Rgb32FImage};
use log::debug;

use crate::error::{StitchError, StitchResult};
use crate::imgops::{distance_transform_l1, reflect101, Point, Rect};

/// Margin around an overlap included in the pairwise problem
const GAP: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeamKind {
    No,
    Voronoi,
    GcColor,
    GcColorGrad,
    DpColor,
    DpColorGrad,
}

/// Per-pixel difference measure used by the graph-cut and DP finders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeamCost {
    Color,
    /// Color difference divided by local gradient strength, so cuts prefer
    /// textured areas where they are hard to see
    ColorGrad,
}

impl SeamKind {
    pub fn from_name(name: &str) -> StitchResult<Self> {
        match name {
            "no" => Ok(Self::No),
            "voronoi" => Ok(Self::Voronoi),
            "gc_color" => Ok(Self::GcColor),
            "gc_colorgrad" => Ok(Self::GcColorGrad),
            "dp_color" => Ok(Self::DpColor),
            "dp_colorgrad" => Ok(Self::DpColorGrad),
            other => Err(StitchError::UnknownSeamFinderKind(other.to_string())),
        }
    }

    pub fn create(&self) -> Box<dyn SeamFinder> {
        match self {
            Self::No => Box::new(NoSeamFinder),
            Self::Voronoi => Box::new(VoronoiSeamFinder),
            Self::GcColor => Box::new(GraphCutSeamFinder::new(SeamCost::Color)),
            Self::GcColorGrad => Box::new(GraphCutSeamFinder::new(SeamCost::ColorGrad)),
            Self::DpColor => Box::new(DpSeamFinder::new(SeamCost::Color)),
            Self::DpColorGrad => Box::new(DpSeamFinder::new(SeamCost::ColorGrad)),
        }
    }
}

pub trait SeamFinder: Send + Sync {
    fn find(&self, images: &[Rgb32FImage], corners: &[Point], masks: &[GrayImage]) -> Vec<GrayImage>;
}

#[derive(Debug, Clone, Default)]
pub struct NoSeamFinder;

impl SeamFinder for NoSeamFinder {
    fn find(&self, _: &[Rgb32FImage], _: &[Point], masks: &[GrayImage]) -> Vec<GrayImage> {
        masks.to_vec()
    }
}

/// Canvas placement of one image
#[derive(Debug, Clone, Copy)]
struct Placement {
    corner: Point,
    size: (u32, u32),
}

impl Placement {
    fn rect(&self) -> Rect {
        Rect::from_corner(self.corner, self.size)
    }

    /// Image coordinates of canvas pixel (cx, cy), if inside the image
    fn local(&self, cx: i32, cy: i32) -> Option<(u32, u32)> {
        let (x, y) = (cx - self.corner.x, cy - self.corner.y);
        (x >= 0 && y >= 0 && (x as u32) < self.size.0 && (y as u32) < self.size.1).then_some((x as u32, y as u32))
    }

    fn center(&self) -> (f64, f64) {
        (
            self.corner.x as f64 + self.size.0 as f64 / 2.0,
            self.corner.y as f64 + self.size.1 as f64 / 2.0,
        )
    }
}

fn placements(corners: &[Point], masks: &[GrayImage]) -> Vec<Placement> {
    corners
        .iter()
        .zip(masks)
        .map(|(&corner, m)| Placement { corner, size: m.dimensions() })
        .collect()
}

/// Run `find_in_pair` on every overlapping pair (i < j) in index order
fn for_each_overlap(places: &[Placement], mut find_in_pair: impl FnMut(usize, usize, Rect)) {
    for i in 0..places.len() {
        for j in i + 1..places.len() {
            if let Some(roi) = places[i].rect().intersect(&places[j].rect()) {
                find_in_pair(i, j, roi);
            }
        }
    }
}

/// Overlap window padded by [`GAP`] on every side
#[derive(Debug, Clone, Copy)]
struct Window {
    x0: i32,
    y0: i32,
    w: usize,
    h: usize,
}

impl Window {
    fn around(roi: &Rect) -> Self {
        Self {
            x0: roi.x - GAP,
            y0: roi.y - GAP,
            w: roi.width as usize + 2 * GAP as usize,
            h: roi.height as usize + 2 * GAP as usize,
        }
    }

    fn canvas(&self, k: usize) -> (i32, i32) {
        (self.x0 + (k % self.w) as i32, self.y0 + (k / self.w) as i32)
    }

    fn len(&self) -> usize {
        self.w * self.h
    }

    fn sub_mask(&self, place: &Placement, mask: &GrayImage) -> Vec<bool> {
        (0..self.len())
            .map(|k| {
                let (cx, cy) = self.canvas(k);
                place
                    .local(cx, cy)
                    .is_some_and(|(x, y)| mask.get_pixel(x, y).0[0] != 0)
            })
            .collect()
    }

    fn write_back(&self, place: &Placement, sub: &[bool], mask: &mut GrayImage) {
        for (k, &keep) in sub.iter().enumerate() {
            let (cx, cy) = self.canvas(k);
            if let Some((x, y)) = place.local(cx, cy) {
                if !keep {
                    mask.get_pixel_mut(x, y).0[0] = 0;
                }
            }
        }
    }
}

/// Splits every overlap along the equidistance line between the parts
/// only one of the images covers
#[derive(Debug, Clone, Default)]
pub struct VoronoiSeamFinder;

impl SeamFinder for VoronoiSeamFinder {
    fn find(&self, _: &[Rgb32FImage], corners: &[Point], masks: &[GrayImage]) -> Vec<GrayImage> {
        let mut out = masks.to_vec();
        let places = placements(corners, masks);
        for_each_overlap(&places, |i, j, roi| {
            let win = Window::around(&roi);
            let mut sub1 = win.sub_mask(&places[i], &out[i]);
            let mut sub2 = win.sub_mask(&places[j], &out[j]);

            let (w, h) = (win.w, win.h);
            let dist1 = distance_transform_l1(w, h, |x, y| sub1[y * w + x] && !sub2[y * w + x]);
            let dist2 = distance_transform_l1(w, h, |x, y| sub2[y * w + x] && !sub1[y * w + x]);

            for k in 0..win.len() {
                if dist1[k] < dist2[k] {
                    sub2[k] = false;
                } else {
                    sub1[k] = false;
                }
            }
            win.write_back(&places[i], &sub1, &mut out[i]);
            win.write_back(&places[j], &sub2, &mut out[j]);
        });
        out
    }
}

/// Minimum cut through each overlap on a 4-connected pixel graph
#[derive(Debug, Clone)]
pub struct GraphCutSeamFinder {
    cost: SeamCost,
    terminal_cost: f64,
    bad_region_penalty: f64,
}

impl GraphCutSeamFinder {
    pub fn new(cost: SeamCost) -> Self {
        Self {
            cost,
            terminal_cost: 10000.0,
            bad_region_penalty: 1000.0,
        }
    }

    fn find_in_pair(
        &self,
        images: &[Rgb32FImage],
        grads: &[Gradients],
        places: &[Placement],
        masks: &mut [GrayImage],
        (i, j): (usize, usize),
        roi: Rect,
    ) {
        let win = Window::around(&roi);
        let (w, h) = (win.w, win.h);
        let sub1 = win.sub_mask(&places[i], &masks[i]);
        let sub2 = win.sub_mask(&places[j], &masks[j]);
        let px1 = sample_window(&win, &places[i], &images[i], grads.get(i));
        let px2 = sample_window(&win, &places[j], &images[j], grads.get(j));

        let mut graph = FlowGraph::new(win.len());
        for k in 0..win.len() {
            graph.add_terminal_weights(
                k,
                if sub1[k] { self.terminal_cost } else { 0.0 },
                if sub2[k] { self.terminal_cost } else { 0.0 },
            );
        }

        const WEIGHT_EPS: f64 = 1.0;
        for y in 0..h {
            for x in 0..w {
                let a = y * w + x;
                let neighbours = [(x + 1 < w, a + 1, true), (y + 1 < h, a + w, false)];
                for (valid, b, horizontal) in neighbours {
                    if !valid {
                        continue;
                    }
                    let color = color_dist(&px1[a], &px2[a]) + color_dist(&px1[b], &px2[b]);
                    let mut weight = match self.cost {
                        SeamCost::Color => color + WEIGHT_EPS,
                        SeamCost::ColorGrad => {
                            let g = |p: &WindowPixel| if horizontal { p.dx } else { p.dy };
                            let grad = g(&px1[a]) + g(&px1[b]) + g(&px2[a]) + g(&px2[b]) + WEIGHT_EPS;
                            color / grad + WEIGHT_EPS
                        }
                    };
                    if !(sub1[a] && sub1[b] && sub2[a] && sub2[b]) {
                        weight += self.bad_region_penalty;
                    }
                    graph.add_edge(a, b, weight, weight);
                }
            }
        }

        let flow = graph.max_flow();
        let source_side = graph.source_segment();
        debug!("Graph cut {}-{}: {}x{} window, flow {:.1}", i, j, w, h, flow);

        let gap = GAP as usize;
        for y in 0..roi.height as usize {
            for x in 0..roi.width as usize {
                let k = (y + gap) * w + x + gap;
                let (cx, cy) = win.canvas(k);
                let (Some(p1), Some(p2)) = (places[i].local(cx, cy), places[j].local(cx, cy)) else {
                    continue;
                };
                if source_side[k] {
                    if masks[i].get_pixel(p1.0, p1.1).0[0] != 0 {
                        masks[j].get_pixel_mut(p2.0, p2.1).0[0] = 0;
                    }
                } else if masks[j].get_pixel(p2.0, p2.1).0[0] != 0 {
                    masks[i].get_pixel_mut(p1.0, p1.1).0[0] = 0;
                }
            }
        }
    }
}

impl SeamFinder for GraphCutSeamFinder {
    fn find(&self, images: &[Rgb32FImage], corners: &[Point], masks: &[GrayImage]) -> Vec<GrayImage> {
        let mut out = masks.to_vec();
        let places = placements(corners, masks);
        let grads: Vec<Gradients> = match self.cost {
            SeamCost::Color => Vec::new(),
            SeamCost::ColorGrad => images.iter().map(Gradients::sobel).collect(),
        };
        for_each_overlap(&places, |i, j, roi| {
            self.find_in_pair(images, &grads, &places, &mut out, (i, j), roi);
        });
        out
    }
}

/// Dynamic-programming seam: one monotone cut across each overlap,
/// running perpendicular to the direction between the image centers
#[derive(Debug, Clone)]
pub struct DpSeamFinder {
    cost: SeamCost,
}

impl DpSeamFinder {
    const OUTSIDE_COST: f64 = 1e6;

    pub fn new(cost: SeamCost) -> Self {
        Self { cost }
    }

    fn find_in_pair(
        &self,
        images: &[Rgb32FImage],
        grads: &[Gradients],
        places: &[Placement],
        masks: &mut [GrayImage],
        (i, j): (usize, usize),
        roi: Rect,
    ) {
        let (w, h) = (roi.width as usize, roi.height as usize);
        let canvas = |x: usize, y: usize| (roi.x + x as i32, roi.y + y as i32);

        let mut both = vec![false; w * h];
        let mut cost = vec![Self::OUTSIDE_COST; w * h];
        for y in 0..h {
            for x in 0..w {
                let (cx, cy) = canvas(x, y);
                let (Some(p1), Some(p2)) = (places[i].local(cx, cy), places[j].local(cx, cy)) else {
                    continue;
                };
                if masks[i].get_pixel(p1.0, p1.1).0[0] == 0 || masks[j].get_pixel(p2.0, p2.1).0[0] == 0 {
                    continue;
                }
                both[y * w + x] = true;
                let a = images[i].get_pixel(p1.0, p1.1).0;
                let b = images[j].get_pixel(p2.0, p2.1).0;
                let color: f64 = (0..3).map(|c| (a[c] as f64 - b[c] as f64).powi(2)).sum();
                cost[y * w + x] = match self.cost {
                    SeamCost::Color => color,
                    SeamCost::ColorGrad => {
                        let g1 = grads.get(i).map_or(0.0, |g| g.magnitude(p1.0, p1.1));
                        let g2 = grads.get(j).map_or(0.0, |g| g.magnitude(p2.0, p2.1));
                        color / (g1 + g2 + 1.0)
                    }
                };
            }
        }
        if !both.iter().any(|&b| b) {
            return;
        }

        let (ci, cj) = (places[i].center(), places[j].center());
        // Side by side: cut top to bottom; stacked: cut left to right
        let vertical = (ci.0 - cj.0).abs() >= (ci.1 - cj.1).abs();
        let (len_a, len_b) = if vertical { (h, w) } else { (w, h) };
        let idx = |a: usize, b: usize| if vertical { a * w + b } else { b * w + a };
        let i_first = if vertical { ci.0 <= cj.0 } else { ci.1 <= cj.1 };

        let mut acc = vec![0.0f64; len_a * len_b];
        for b in 0..len_b {
            acc[b] = cost[idx(0, b)];
        }
        for a in 1..len_a {
            for b in 0..len_b {
                let lo = b.saturating_sub(1);
                let hi = (b + 1).min(len_b - 1);
                let best = (lo..=hi).map(|bb| acc[(a - 1) * len_b + bb]).fold(f64::INFINITY, f64::min);
                acc[a * len_b + b] = cost[idx(a, b)] + best;
            }
        }

        let mut seam = vec![0usize; len_a];
        let last = &acc[(len_a - 1) * len_b..];
        seam[len_a - 1] = argmin(last.iter().copied());
        for a in (0..len_a - 1).rev() {
            let prev = seam[a + 1];
            let lo = prev.saturating_sub(1);
            let hi = (prev + 1).min(len_b - 1);
            seam[a] = lo + argmin((lo..=hi).map(|bb| acc[a * len_b + bb]));
        }

        for a in 0..len_a {
            for b in 0..len_b {
                let k = idx(a, b);
                if !both[k] {
                    continue;
                }
                let (x, y) = (k % w, k / w);
                let (cx, cy) = canvas(x, y);
                let first_side = b < seam[a];
                let loser = if first_side == i_first { j } else { i };
                if let Some((lx, ly)) = places[loser].local(cx, cy) {
                    masks[loser].get_pixel_mut(lx, ly).0[0] = 0;
                }
            }
        }
        debug!("DP seam {}-{} ({})", i, j, if vertical { "vertical" } else { "horizontal" });
    }
}

fn argmin(values: impl Iterator<Item = f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::INFINITY), |best, (k, v)| if v < best.1 { (k, v) } else { best })
        .0
}

impl SeamFinder for DpSeamFinder {
    fn find(&self, images: &[Rgb32FImage], corners: &[Point], masks: &[GrayImage]) -> Vec<GrayImage> {
        let mut out = masks.to_vec();
        let places = placements(corners, masks);
        let grads: Vec<Gradients> = match self.cost {
            SeamCost::Color => Vec::new(),
            SeamCost::ColorGrad => images.iter().map(Gradients::sobel).collect(),
        };
        for_each_overlap(&places, |i, j, roi| {
            self.find_in_pair(images, &grads, &places, &mut out, (i, j), roi);
        });
        out
    }
}

/// Absolute Sobel responses of the luminance
#[derive(Debug, Clone)]
struct Gradients {
    width: usize,
    dx: Vec<f32>,
    dy: Vec<f32>,
}

impl Gradients {
    fn sobel(img: &Rgb32FImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let gray: Vec<f32> = img
            .pixels()
            .map(|p| 0.299 * p.0[0] + 0.587 * p.0[1] + 0.114 * p.0[2])
            .collect();
        let at = |x: i64, y: i64| gray[reflect101(y, h as i64) * w + reflect101(x, w as i64)];
        let mut dx = vec![0.0; w * h];
        let mut dy = vec![0.0; w * h];
        for y in 0..h as i64 {
            for x in 0..w as i64 {
                let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
                let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                    - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
                let k = y as usize * w + x as usize;
                dx[k] = gx.abs();
                dy[k] = gy.abs();
            }
        }
        Self { width: w, dx, dy }
    }

    fn magnitude(&self, x: u32, y: u32) -> f64 {
        let k = y as usize * self.width + x as usize;
        (self.dx[k] + self.dy[k]) as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowPixel {
    color: [f32; 3],
    dx: f64,
    dy: f64,
}

fn sample_window(win: &Window, place: &Placement, img: &Rgb32FImage, grads: Option<&Gradients>) -> Vec<WindowPixel> {
    (0..win.len())
        .map(|k| {
            let (cx, cy) = win.canvas(k);
            match place.local(cx, cy) {
                Some((x, y)) => {
                    let (dx, dy) = grads.map_or((0.0, 0.0), |g| {
                        let idx = y as usize * g.width + x as usize;
                        (g.dx[idx] as f64, g.dy[idx] as f64)
                    });
                    WindowPixel { color: img.get_pixel(x, y).0, dx, dy }
                }
                None => WindowPixel::default(),
            }
        })
        .collect()
}

/// Squared RGB distance
fn color_dist(a: &WindowPixel, b: &WindowPixel) -> f64 {
    (0..3).map(|c| (a.color[c] as f64 - b.color[c] as f64).powi(2)).sum()
}

/// Residual graph for max-flow by Dinic's algorithm. Arcs are stored in
/// pairs so `e ^ 1` is the reverse of `e`.
struct FlowGraph {
    adjacency: Vec<Vec<usize>>,
    to: Vec<usize>,
    cap: Vec<f64>,
    source: usize,
    sink: usize,
    /// Flow pushed straight through vertices that are tied to both terminals
    preflow: f64,
}

impl FlowGraph {
    const EPS: f64 = 1e-9;

    fn new(n_vertices: usize) -> Self {
        Self {
            adjacency: vec![Vec::new(); n_vertices + 2],
            to: Vec::new(),
            cap: Vec::new(),
            source: n_vertices,
            sink: n_vertices + 1,
            preflow: 0.0,
        }
    }

    fn add_edge(&mut self, u: usize, v: usize, cap_uv: f64, cap_vu: f64) {
        let e = self.to.len();
        self.to.push(v);
        self.cap.push(cap_uv);
        self.to.push(u);
        self.cap.push(cap_vu);
        self.adjacency[u].push(e);
        self.adjacency[v].push(e + 1);
    }

    fn add_terminal_weights(&mut self, v: usize, source_cap: f64, sink_cap: f64) {
        let common = source_cap.min(sink_cap);
        self.preflow += common;
        let (s, t) = (source_cap - common, sink_cap - common);
        if s > 0.0 {
            self.add_edge(self.source, v, s, 0.0);
        }
        if t > 0.0 {
            self.add_edge(v, self.sink, t, 0.0);
        }
    }

    fn levels(&self) -> Option<Vec<u32>> {
        let mut level = vec![u32::MAX; self.adjacency.len()];
        level[self.source] = 0;
        let mut queue = VecDeque::from([self.source]);
        while let Some(v) = queue.pop_front() {
            for &e in &self.adjacency[v] {
                let u = self.to[e];
                if self.cap[e] > Self::EPS && level[u] == u32::MAX {
                    level[u] = level[v] + 1;
                    queue.push_back(u);
                }
            }
        }
        (level[self.sink] != u32::MAX).then_some(level)
    }

    fn max_flow(&mut self) -> f64 {
        let mut total = self.preflow;
        while let Some(mut level) = self.levels() {
            let mut next = vec![0usize; self.adjacency.len()];
            let mut path: Vec<usize> = Vec::new();
            let mut v = self.source;
            loop {
                if v == self.sink {
                    let pushed = path.iter().map(|&e| self.cap[e]).fold(f64::INFINITY, f64::min);
                    for &e in &path {
                        self.cap[e] -= pushed;
                        self.cap[e ^ 1] += pushed;
                    }
                    total += pushed;
                    path.clear();
                    v = self.source;
                    continue;
                }

                let mut advanced = false;
                while next[v] < self.adjacency[v].len() {
                    let e = self.adjacency[v][next[v]];
                    let u = self.to[e];
                    if self.cap[e] > Self::EPS && level[u] == level[v] + 1 {
                        path.push(e);
                        v = u;
                        advanced = true;
                        break;
                    }
                    next[v] += 1;
                }
                if advanced {
                    continue;
                }

                // Dead end: drop v from the level graph and step back
                level[v] = u32::MAX;
                match path.pop() {
                    Some(e) => {
                        v = self.to[e ^ 1];
                        next[v] += 1;
                    }
                    None => break,
                }
            }
        }
        total
    }

    /// Vertices reachable from the source in the residual graph
    fn source_segment(&self) -> Vec<bool> {
        let mut seen = vec![false; self.adjacency.len()];
        seen[self.source] = true;
        let mut queue = VecDeque::from([self.source]);
        while let Some(v) = queue.pop_front() {
            for &e in &self.adjacency[v] {
                let u = self.to[e];
                if self.cap[e] > Self::EPS && !seen[u] {
                    seen[u] = true;
                    queue.push_back(u);
                }
            }
        }
        seen
    }
}
