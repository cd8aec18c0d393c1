//! Image connectivity: union-find, largest-component selection, the
//! maximum spanning tree used for pose propagation and DOT export.

use std::collections::VecDeque;
use std::path::Path;

use log::{debug, info};
use pano_core::ImageFeatures;

use crate::matcher::PairwiseMatches;

/// Union-find with union by size
#[derive(Debug, Clone)]
pub struct DisjointSets {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSets {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`; false if they already were one set
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    pub fn set_size(&mut self, x: usize) -> usize {
        let r = self.find(x);
        self.size[r]
    }
}

/// Images kept by [`leave_biggest_component`], re-indexed 0..k-1
#[derive(Debug, Clone)]
pub struct Component {
    /// Original indices in ascending order
    pub indices: Vec<usize>,
    pub features: Vec<ImageFeatures>,
    pub matches: PairwiseMatches,
}

/// Keep the largest set of images connected by pairs with confidence of
/// at least `conf_threshold`. Among equally large components the one
/// holding the lowest image index wins.
pub fn leave_biggest_component(
    features: &[ImageFeatures],
    matches: &PairwiseMatches,
    conf_threshold: f64,
) -> Component {
    let n = features.len();
    let mut comps = DisjointSets::new(n);
    for i in 0..n {
        for j in i + 1..n {
            if matches.get(i, j).confidence >= conf_threshold {
                comps.union(i, j);
            }
        }
    }

    // Scanning in index order visits every component first through its
    // lowest member, so strict `>` keeps the earliest on ties
    let mut best_root = None;
    let mut best_size = 0;
    for i in 0..n {
        let root = comps.find(i);
        let size = comps.set_size(root);
        if size > best_size {
            best_size = size;
            best_root = Some(root);
        }
    }

    let indices: Vec<usize> = match best_root {
        Some(root) => (0..n).filter(|&i| comps.find(i) == root).collect(),
        None => Vec::new(),
    };

    if indices.len() < n {
        info!("Keeping {} of {} images: {:?}", indices.len(), n, indices);
    }

    let features = indices
        .iter()
        .enumerate()
        .map(|(new_idx, &i)| ImageFeatures {
            img_idx: new_idx,
            ..features[i].clone()
        })
        .collect();

    Component {
        matches: matches.subset(&indices),
        features,
        indices,
    }
}

/// Maximum spanning tree over pairs with a homography, weighted by inlier
/// count, plus the vertices minimizing the maximum hop distance (centers)
#[derive(Debug, Clone)]
pub struct SpanningTree {
    pub adjacency: Vec<Vec<usize>>,
    pub centers: Vec<usize>,
}

impl SpanningTree {
    pub fn find_max(matches: &PairwiseMatches) -> Self {
        let n = matches.num_images();
        let mut edges: Vec<(usize, usize, usize)> = Vec::new();
        for i in 0..n {
            for j in i + 1..n {
                let m = matches.get(i, j);
                if m.h.is_some() {
                    edges.push((i, j, m.num_inliers));
                }
            }
        }
        // Stable sort: equal weights keep index order
        edges.sort_by(|a, b| b.2.cmp(&a.2));

        let mut comps = DisjointSets::new(n);
        let mut adjacency = vec![Vec::new(); n];
        for (i, j, _) in edges {
            if comps.union(i, j) {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }

        let leaves: Vec<usize> = (0..n).filter(|&i| adjacency[i].len() == 1).collect();
        let mut max_dists = vec![0usize; n];
        for &leaf in &leaves {
            let dists = hop_distances(&adjacency, leaf);
            for (m, d) in max_dists.iter_mut().zip(dists) {
                if let Some(d) = d {
                    *m = (*m).max(d);
                }
            }
        }

        let min_max = max_dists.iter().copied().min().unwrap_or(0);
        let centers = (0..n).filter(|&i| max_dists[i] == min_max).collect();
        debug!("Spanning tree centers: {:?}", centers);

        Self { adjacency, centers }
    }

    pub fn center(&self) -> usize {
        self.centers.first().copied().unwrap_or(0)
    }

    /// Visit tree edges breadth-first from `root` as (from, to)
    pub fn walk_breadth_first(&self, root: usize, mut visit: impl FnMut(usize, usize)) {
        let mut seen = vec![false; self.adjacency.len()];
        let mut queue = VecDeque::from([root]);
        seen[root] = true;
        while let Some(v) = queue.pop_front() {
            for &u in &self.adjacency[v] {
                if !seen[u] {
                    seen[u] = true;
                    visit(v, u);
                    queue.push_back(u);
                }
            }
        }
    }
}

fn hop_distances(adjacency: &[Vec<usize>], from: usize) -> Vec<Option<usize>> {
    let mut dist = vec![None; adjacency.len()];
    dist[from] = Some(0);
    let mut queue = VecDeque::from([from]);
    while let Some(v) = queue.pop_front() {
        let d = dist[v].unwrap_or(0);
        for &u in &adjacency[v] {
            if dist[u].is_none() {
                dist[u] = Some(d + 1);
                queue.push_back(u);
            }
        }
    }
    dist
}

/// Graphviz description of the confident spanning forest of the match graph.
/// Nodes are file names without directories; images with no confident
/// neighbour are listed alone.
pub fn matches_graph_as_string(paths: &[String], matches: &PairwiseMatches, conf_threshold: f64) -> String {
    let n = paths.len();
    let mut comps = DisjointSets::new(n);
    let mut edges = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            if matches.get(i, j).confidence >= conf_threshold && comps.union(i, j) {
                edges.push((i, j));
            }
        }
    }

    let name = |i: usize| {
        Path::new(&paths[i])
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| paths[i].clone())
    };

    let mut out = String::from("graph matches_graph{\n");
    for (i, j) in edges {
        let m = matches.get(i, j);
        out.push_str(&format!(
            "\"{}\" -- \"{}\"[label=\"Nm={}, Ni={}, C={}\"];\n",
            name(i),
            name(j),
            m.matches.len(),
            m.num_inliers,
            m.confidence
        ));
    }
    for i in 0..n {
        if comps.set_size(i) == 1 {
            out.push_str(&format!("\"{}\";\n", name(i)));
        }
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatchesInfo;
    use nalgebra::Matrix3;

    fn table(n: usize, edges: &[(usize, usize, f64, usize)]) -> PairwiseMatches {
        let mut t = PairwiseMatches::empty(n);
        for &(i, j, confidence, num_inliers) in edges {
            t.set_pair(MatchesInfo {
                src_img_idx: i,
                dst_img_idx: j,
                confidence,
                num_inliers,
                h: Some(Matrix3::identity()),
                ..MatchesInfo::default()
            });
        }
        t
    }

    fn features(n: usize) -> Vec<ImageFeatures> {
        (0..n).map(|i| ImageFeatures { img_idx: i, ..Default::default() }).collect()
    }

    #[test]
    fn test_disjoint_sets() {
        let mut ds = DisjointSets::new(4);
        assert!(ds.union(0, 1));
        assert!(ds.union(2, 1));
        assert!(!ds.union(0, 2));
        assert_eq!(ds.set_size(2), 3);
        assert_eq!(ds.set_size(3), 1);
    }

    #[test]
    fn test_biggest_component() {
        let t = table(5, &[(0, 3, 0.5, 10), (1, 2, 1.5, 30), (2, 4, 2.0, 40)]);
        let c = leave_biggest_component(&features(5), &t, 1.0);
        assert_eq!(c.indices, vec![1, 2, 4]);
        assert_eq!(c.features.iter().map(|f| f.img_idx).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(c.matches.get(1, 2).num_inliers, 40);
        assert_eq!(c.matches.get(0, 1).confidence, 1.5);
    }

    #[test]
    fn test_tie_goes_to_lowest_index() {
        let t = table(4, &[(2, 3, 2.0, 10), (0, 1, 2.0, 10)]);
        let c = leave_biggest_component(&features(4), &t, 1.0);
        assert_eq!(c.indices, vec![0, 1]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let t = table(2, &[(0, 1, 1.0, 10)]);
        assert_eq!(leave_biggest_component(&features(2), &t, 1.0).indices, vec![0, 1]);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let t = table(4, &[(0, 2, 1.2, 10), (2, 3, 1.1, 10)]);
        let first = leave_biggest_component(&features(4), &t, 1.0);
        let second = leave_biggest_component(&first.features, &first.matches, 1.0);
        assert_eq!(second.indices, vec![0, 1, 2]);
        assert_eq!(second.matches.get(1, 2).confidence, first.matches.get(1, 2).confidence);
    }

    #[test]
    fn test_spanning_tree_center() {
        // Chain 0-1-2-3-4 with a weak shortcut 0-4
        let t = table(5, &[(0, 1, 1.0, 50), (1, 2, 1.0, 50), (2, 3, 1.0, 50), (3, 4, 1.0, 50), (0, 4, 1.0, 5)]);
        let tree = SpanningTree::find_max(&t);
        assert_eq!(tree.center(), 2);
        assert!(!tree.adjacency[0].contains(&4));

        let mut visited = Vec::new();
        tree.walk_breadth_first(2, |from, to| visited.push((from, to)));
        assert_eq!(visited.len(), 4);
        assert_eq!(visited[0].0, 2);
    }

    #[test]
    fn test_graph_string() {
        let t = table(3, &[(0, 1, 1.5, 12)]);
        let names = vec!["dir/a.jpg".to_string(), "b.jpg".to_string(), "/x/c.jpg".to_string()];
        let s = matches_graph_as_string(&names, &t, 1.0);
        assert!(s.starts_with("graph matches_graph{\n"));
        assert!(s.contains("\"a.jpg\" -- \"b.jpg\"[label=\"Nm=0, Ni=12, C=1.5\"];\n"));
        assert!(s.contains("\"c.jpg\";\n"));
        assert!(s.ends_with('}'));
    }
}
