//! Queue Manager
//!
//! Track ordering, shuffle/unshuffle and repeat-aware next/previous
//! selection over a party's [`PlaybackState`].

use rand::seq::SliceRandom;
use rand::Rng;

use super::protocol::{RepeatMode, TrackId};
use super::state::{PlaybackState, SyncError};

/// Outcome of a next/previous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Start the track at this queue index from the beginning
    Play(usize),
    /// End of queue: stop but keep the selection
    Stop,
    /// Nothing to select
    Nothing,
}

impl PlaybackState {
    pub fn select_next(&self) -> Selection {
        let len = self.queue.len();
        if len == 0 {
            return Selection::Nothing;
        }
        let Some(index) = self.current_index else {
            return Selection::Play(0);
        };

        if self.repeat_mode == RepeatMode::One {
            Selection::Play(index)
        } else if index + 1 < len {
            Selection::Play(index + 1)
        } else if self.repeat_mode == RepeatMode::All {
            Selection::Play(0)
        } else {
            Selection::Stop
        }
    }

    pub fn select_prev(&self) -> Selection {
        let len = self.queue.len();
        if len == 0 {
            return Selection::Nothing;
        }
        match self.current_index {
            Some(index) if index > 0 => Selection::Play(index - 1),
            _ if self.repeat_mode == RepeatMode::All => Selection::Play(len - 1),
            _ => Selection::Play(0),
        }
    }

    /// Make `index` current and start it from zero
    pub(crate) fn play_index(&mut self, index: usize) {
        self.current_index = Some(index);
        self.current_track_id = self.queue.get(index).cloned();
        self.current_time = 0.0;
        self.is_playing = self.current_track_id.is_some();
    }

    /// Append a track; an empty queue gets it as the (paused) current track
    pub(crate) fn append(&mut self, track_id: TrackId) {
        if self.is_shuffled {
            self.original_queue.push(track_id.clone());
        }
        self.queue.push(track_id);

        if self.current_index.is_none() {
            self.current_index = Some(0);
            self.current_track_id = self.queue.first().cloned();
            self.current_time = 0.0;
        }
    }

    pub(crate) fn remove_at(&mut self, position: usize) -> Result<TrackId, SyncError> {
        if position >= self.queue.len() {
            return Err(SyncError::InvalidPosition {
                position,
                len: self.queue.len(),
            });
        }

        let removed = self.queue.remove(position);
        if self.is_shuffled {
            if let Some(i) = self.original_queue.iter().position(|t| *t == removed) {
                self.original_queue.remove(i);
            }
        }

        match self.current_index {
            Some(current) if position < current => {
                self.current_index = Some(current - 1);
            }
            Some(current) if position == current => {
                if self.queue.is_empty() {
                    self.clear();
                } else {
                    let next = position.min(self.queue.len() - 1);
                    self.current_index = Some(next);
                    self.current_track_id = self.queue.get(next).cloned();
                    self.current_time = 0.0;
                }
            }
            _ => {}
        }

        Ok(removed)
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.original_queue.clear();
        self.current_index = None;
        self.current_track_id = None;
        self.current_time = 0.0;
        self.is_playing = false;
        self.is_shuffled = false;
    }

    /// Shuffle, keeping the current track current (moved to the front)
    pub(crate) fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.original_queue = self.queue.clone();

        let mut order = self.queue.clone();
        match self.current_index {
            Some(index) if index < order.len() => {
                let current = order.remove(index);
                order.shuffle(rng);
                order.insert(0, current);
                self.current_index = Some(0);
            }
            _ => order.shuffle(rng),
        }

        self.queue = order;
        self.is_shuffled = true;
    }

    /// Restore the pre-shuffle order, following the current track
    pub(crate) fn unshuffle(&mut self) {
        self.queue = std::mem::take(&mut self.original_queue);
        self.is_shuffled = false;

        self.current_index = match &self.current_track_id {
            Some(track) => self.queue.iter().position(|t| t == track),
            None => None,
        };
        if self.current_index.is_none() {
            self.current_track_id = None;
            self.is_playing = false;
        }
    }
}
