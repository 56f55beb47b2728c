//! First- and second-order spatial neighbours on the voxel lattice.
//!
//! Built once from the voxel coordinate list. First-order neighbours are
//! axis-aligned unit steps over the first `spatial_dims` axes; second-order
//! neighbours are neighbours-of-neighbours, excluding the voxel itself and
//! its first-order neighbours (capturing diagonal and two-step-axial
//! voxels). Both relations are stored as ragged index vectors.

use std::collections::HashMap;

use fabber_core::{FabberError, FabberResult};

/// First- and second-order neighbour indices for every voxel.
#[derive(Debug, Clone)]
pub struct NeighbourGraph {
    n1: Vec<Vec<usize>>,
    n2: Vec<Vec<usize>>,
    spatial_dims: usize,
}

impl NeighbourGraph {
    /// Build the neighbour relations for the given voxel coordinates.
    ///
    /// `spatial_dims` of 0 disables spatial coupling entirely (every voxel
    /// has no neighbours); 2 restricts neighbours to the in-slice axes; 3
    /// uses the full volume.
    pub fn build(coords: &[[i32; 3]], spatial_dims: usize) -> FabberResult<Self> {
        if spatial_dims > 3 {
            return Err(FabberError::invalid_option(
                "spatial-dims",
                spatial_dims.to_string(),
                "must be 0, 1, 2 or 3",
            ));
        }

        let index: HashMap<[i32; 3], usize> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i))
            .collect();
        if index.len() != coords.len() {
            return Err(FabberError::internal(
                "duplicate voxel coordinates in neighbour graph",
            ));
        }

        let mut n1 = vec![Vec::new(); coords.len()];
        for (v, coord) in coords.iter().enumerate() {
            for axis in 0..spatial_dims {
                for step in [-1, 1] {
                    let mut probe = *coord;
                    probe[axis] += step;
                    if let Some(&u) = index.get(&probe) {
                        n1[v].push(u);
                    }
                }
            }
            n1[v].sort_unstable();
        }

        let mut n2 = vec![Vec::new(); coords.len()];
        for v in 0..coords.len() {
            let mut second: Vec<usize> = n1[v]
                .iter()
                .flat_map(|&w| n1[w].iter().copied())
                .filter(|&u| u != v && !n1[v].contains(&u))
                .collect();
            second.sort_unstable();
            second.dedup();
            n2[v] = second;
        }

        Ok(Self {
            n1,
            n2,
            spatial_dims,
        })
    }

    /// Number of voxels.
    #[must_use]
    pub fn n_voxels(&self) -> usize {
        self.n1.len()
    }

    /// The spatial dimensionality the graph was built with.
    #[must_use]
    pub fn spatial_dims(&self) -> usize {
        self.spatial_dims
    }

    /// First-order neighbours of a voxel.
    #[must_use]
    pub fn first(&self, voxel: usize) -> &[usize] {
        &self.n1[voxel]
    }

    /// Second-order neighbours of a voxel.
    #[must_use]
    pub fn second(&self, voxel: usize) -> &[usize] {
        &self.n2[voxel]
    }

    /// The number of first-order neighbours an interior voxel would have.
    ///
    /// Used by the Dirichlet-boundary shrinkage prior, which replaces the
    /// actual neighbour count at edge voxels with this lattice-expected
    /// count.
    #[must_use]
    pub fn expected_first_count(&self) -> usize {
        2 * self.spatial_dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_coords(n: i32) -> Vec<[i32; 3]> {
        (0..n).map(|x| [x, 0, 0]).collect()
    }

    #[test]
    fn test_line_neighbours() {
        let graph = NeighbourGraph::build(&line_coords(4), 1).unwrap();
        assert_eq!(graph.first(0), &[1]);
        assert_eq!(graph.first(1), &[0, 2]);
        assert_eq!(graph.first(3), &[2]);
        // Second order skips over the direct neighbour
        assert_eq!(graph.second(0), &[2]);
        assert_eq!(graph.second(1), &[3]);
    }

    #[test]
    fn test_symmetry() {
        let coords: Vec<[i32; 3]> = (0..3)
            .flat_map(|x| (0..3).map(move |y| [x, y, 0]))
            .collect();
        let graph = NeighbourGraph::build(&coords, 2).unwrap();
        for v in 0..coords.len() {
            for &u in graph.first(v) {
                assert!(graph.first(u).contains(&v), "N1 symmetry broken at {v}<->{u}");
            }
            for &u in graph.second(v) {
                assert!(graph.second(u).contains(&v), "N2 symmetry broken at {v}<->{u}");
            }
        }
    }

    #[test]
    fn test_second_order_includes_diagonals() {
        let coords: Vec<[i32; 3]> = (0..2)
            .flat_map(|x| (0..2).map(move |y| [x, y, 0]))
            .collect();
        let graph = NeighbourGraph::build(&coords, 2).unwrap();
        // (0,0) and (1,1) are diagonal: second-order, not first
        let v00 = 0;
        let v11 = 3;
        assert!(!graph.first(v00).contains(&v11));
        assert!(graph.second(v00).contains(&v11));
    }

    #[test]
    fn test_zero_dims_disables_neighbours() {
        let graph = NeighbourGraph::build(&line_coords(5), 0).unwrap();
        for v in 0..5 {
            assert!(graph.first(v).is_empty());
            assert!(graph.second(v).is_empty());
        }
    }

    #[test]
    fn test_slice_only_ignores_z_axis() {
        let coords = vec![[0, 0, 0], [0, 0, 1], [1, 0, 0]];
        let graph = NeighbourGraph::build(&coords, 2).unwrap();
        // z-step voxel is not a neighbour when restricted to 2 dims
        assert_eq!(graph.first(0), &[2]);
    }

    #[test]
    fn test_invalid_dims_rejected() {
        assert!(NeighbourGraph::build(&line_coords(2), 4).is_err());
    }
}
