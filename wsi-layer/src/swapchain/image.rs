// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use smallvec::SmallVec;
use std::collections::VecDeque;

/// Where a swapchain image is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageStatus {
    /// The image has no usable resources. Every image starts and ends here.
    Invalid,
    /// The image can be acquired.
    Free,
    /// The application owns the image.
    Acquired,
    /// The image was presented and the window system may still read it.
    Presented,
}

/// A present whose completion was not observed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingCompletion {
    pub(crate) serial: u32,
    /// Zero if the present had no id.
    pub(crate) present_id: u64,
}

#[derive(Debug)]
struct ImageSlot {
    status: ImageStatus,
    pending: VecDeque<PendingCompletion>,
}

/// What a batch of completions did to the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CompletionProgress {
    /// Images that went from `Presented` to `Free`.
    pub(crate) freed: SmallVec<[u32; 4]>,
    /// The highest present id among the completed presents.
    pub(crate) present_id: Option<u64>,
}

/// Status and pending completions of every image of a swapchain.
///
/// This is only accessed under the swapchain's state mutex.
#[derive(Debug)]
pub(crate) struct ImagePool {
    slots: Vec<ImageSlot>,
}

impl ImagePool {
    pub(crate) fn new(count: usize) -> Self {
        ImagePool {
            slots: (0..count)
                .map(|_| ImageSlot {
                    status: ImageStatus::Invalid,
                    pending: VecDeque::new(),
                })
                .collect(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `None` if `index` is out of range.
    #[inline]
    pub(crate) fn status(&self, index: u32) -> Option<ImageStatus> {
        self.slots.get(index as usize).map(|slot| slot.status)
    }

    #[inline]
    pub(crate) fn set_status(&mut self, index: u32, status: ImageStatus) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.status = status;
        }
    }

    pub(crate) fn mark_all_free(&mut self) {
        for slot in &mut self.slots {
            slot.status = ImageStatus::Free;
        }
    }

    /// Marks the first free image as acquired and returns its index.
    pub(crate) fn acquire_free(&mut self) -> Option<u32> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.status == ImageStatus::Free)?;
        self.slots[index].status = ImageStatus::Acquired;

        Some(index as u32)
    }

    pub(crate) fn count(&self, status: ImageStatus) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == status)
            .count()
    }

    /// Gives the image back without waiting for its completions, which are dropped.
    pub(crate) fn unpresent(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.pending.clear();
            slot.status = ImageStatus::Free;
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self, index: u32) -> usize {
        self.slots
            .get(index as usize)
            .map_or(0, |slot| slot.pending.len())
    }

    /// Returns whether any image waits for a completion.
    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        self.slots.iter().any(|slot| !slot.pending.is_empty())
    }

    pub(crate) fn push_pending(&mut self, index: u32, completion: PendingCompletion) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.pending.push_back(completion);
        }
    }

    /// Removes the completions with the given serials.
    ///
    /// A presented image whose queue becomes empty is freed. Serials that match nothing are
    /// ignored.
    pub(crate) fn complete(&mut self, serials: &[u32]) -> CompletionProgress {
        let mut progress = CompletionProgress::default();

        for &serial in serials {
            for (index, slot) in self.slots.iter_mut().enumerate() {
                let Some(position) = slot.pending.iter().position(|c| c.serial == serial) else {
                    continue;
                };

                if let Some(completion) = slot.pending.remove(position) {
                    if completion.present_id != 0 {
                        progress.present_id = progress.present_id.max(Some(completion.present_id));
                    }
                }

                if slot.pending.is_empty() && slot.status == ImageStatus::Presented {
                    slot.status = ImageStatus::Free;
                    progress.freed.push(index as u32);
                }

                break;
            }
        }

        progress
    }

    pub(crate) fn invalidate_all(&mut self) {
        for slot in &mut self.slots {
            slot.pending.clear();
            slot.status = ImageStatus::Invalid;
        }
    }
}
