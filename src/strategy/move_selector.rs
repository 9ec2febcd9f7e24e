use rand::seq::SliceRandom;
use std::collections::HashSet;

use crate::domain::Cell;

/// Picks the next cell to claim.
pub trait MoveSelector: Send + Sync {
    /// A cell on a `board_size` square board not in `blocked`, or `None`
    /// when the board is exhausted.
    fn choose(&self, board_size: u8, blocked: &HashSet<Cell>) -> Option<Cell>;
}

/// Uniformly random free cell.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl MoveSelector for RandomSelector {
    fn choose(&self, board_size: u8, blocked: &HashSet<Cell>) -> Option<Cell> {
        let free: Vec<Cell> = (0..board_size)
            .flat_map(|x| (0..board_size).map(move |y| Cell::new(x, y)))
            .filter(|c| !blocked.contains(c))
            .collect();
        free.choose(&mut rand::thread_rng()).copied()
    }
}
