// Frame loop state machine
//
// wait -> acquire -> reset -> record -> submit -> present, over a ring of
// N slots addressed by `counter % N`. The GPU side sits behind
// `FrameBackend` so the ordering rules can be driven without a device.

use super::error::RendererResult;
use super::swapchain::{Acquire, PresentStatus};
use super::sync::SlotPhase;

/// Consecutive suboptimal acquires that force a recreation
const SUBOPTIMAL_STREAK_LIMIT: u32 = 2;

/// What one pass of the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and queued for presentation
    Presented {
        slot: usize,
        image_index: u32,
        /// The swapchain was rebuilt at some point during this pass
        recreated: bool,
    },
    /// Acquire found the swapchain out of date; it was rebuilt and the
    /// same slot is used again next pass
    Retry,
    /// The window has no drawable area; no slot was touched
    Suspended,
}

/// GPU operations one frame is made of
///
/// Every method except `recreate` acts on exactly one slot. `recreate`
/// returns false when there is nothing to present into (zero extent).
pub trait FrameBackend {
    type Slot;

    /// Block until the slot's fence is signaled
    fn wait(&mut self, slot: &Self::Slot) -> RendererResult<()>;
    fn acquire(&mut self, slot: &Self::Slot) -> RendererResult<Acquire>;
    /// Unsignal the fence and empty the command buffer
    fn reset(&mut self, slot: &Self::Slot) -> RendererResult<()>;
    fn record(&mut self, slot: &Self::Slot, image_index: u32) -> RendererResult<()>;
    fn submit(&mut self, slot: &Self::Slot) -> RendererResult<()>;
    fn present(&mut self, slot: &Self::Slot, image_index: u32) -> RendererResult<PresentStatus>;
    fn recreate(&mut self) -> RendererResult<bool>;
}

/// Fixed arena of slots and the rolling counter addressing them
pub struct FrameRing<S> {
    slots: Vec<S>,
    phases: Vec<SlotPhase>,
    counter: u64,
}

impl<S> FrameRing<S> {
    pub fn new(slots: Vec<S>) -> Self {
        assert!(!slots.is_empty(), "frame ring needs at least one slot");
        let phases = vec![SlotPhase::default(); slots.len()];
        Self {
            slots,
            phases,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn current(&self) -> usize {
        (self.counter % self.slots.len() as u64) as usize
    }

    pub fn advance(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    pub fn slots(&self) -> &[S] {
        &self.slots
    }
}

/// When the swapchain has to be rebuilt
#[derive(Debug, Default, Clone, Copy)]
pub struct StalenessPolicy {
    requested: bool,
    suboptimal_streak: u32,
}

impl StalenessPolicy {
    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn note_acquire(&mut self, suboptimal: bool) {
        if suboptimal {
            self.suboptimal_streak += 1;
            if self.suboptimal_streak >= SUBOPTIMAL_STREAK_LIMIT {
                self.requested = true;
            }
        } else {
            self.suboptimal_streak = 0;
        }
    }

    pub fn note_present(&mut self, status: PresentStatus) {
        if status == PresentStatus::Stale {
            self.requested = true;
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn recreated(&mut self) {
        self.requested = false;
        self.suboptimal_streak = 0;
    }
}

pub struct FrameLoop<S> {
    ring: FrameRing<S>,
    staleness: StalenessPolicy,
}

impl<S> FrameLoop<S> {
    pub fn new(slots: Vec<S>) -> Self {
        Self {
            ring: FrameRing::new(slots),
            staleness: StalenessPolicy::default(),
        }
    }

    pub fn slots(&self) -> &[S] {
        self.ring.slots()
    }

    pub fn frame_counter(&self) -> u64 {
        self.ring.counter()
    }

    /// Rebuild the swapchain before the next frame (e.g. after a resize)
    pub fn request_recreate(&mut self) {
        self.staleness.request();
    }

    /// Run one pass of the loop
    pub fn run_frame<B>(&mut self, backend: &mut B) -> RendererResult<FrameOutcome>
    where
        B: FrameBackend<Slot = S>,
    {
        let mut recreated = false;

        // Pending recreation first; nothing to do while minimized
        if self.staleness.is_requested() {
            if !Self::recreate(&mut self.staleness, backend)? {
                return Ok(FrameOutcome::Suspended);
            }
            recreated = true;
        }

        let index = self.ring.current();
        let slot = &self.ring.slots[index];
        let phase = &mut self.ring.phases[index];

        // Step 1: Wait
        backend.wait(slot)?;
        phase.fence_observed();

        // Step 2: Acquire
        let image_index = match backend.acquire(slot)? {
            Acquire::Image { index: image, suboptimal } => {
                self.staleness.note_acquire(suboptimal);
                image
            }
            Acquire::OutOfDate => {
                log::debug!("Swapchain out of date on acquire (slot {})", index);
                self.staleness.request();
                return Ok(if Self::recreate(&mut self.staleness, backend)? {
                    FrameOutcome::Retry
                } else {
                    FrameOutcome::Suspended
                });
            }
        };

        // Steps 3-5: Reset, record, submit
        phase.begin_recording(index)?;
        backend.reset(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;
        phase.submitted();

        // Step 6: Present
        let status = backend.present(slot, image_index)?;
        self.staleness.note_present(status);

        // Step 7: Advance
        self.ring.advance();

        if self.staleness.is_requested() {
            log::debug!("Swapchain stale after present, recreating");
            recreated |= Self::recreate(&mut self.staleness, backend)?;
        }

        Ok(FrameOutcome::Presented {
            slot: index,
            image_index,
            recreated,
        })
    }

    fn recreate<B: FrameBackend>(
        staleness: &mut StalenessPolicy,
        backend: &mut B,
    ) -> RendererResult<bool> {
        if backend.recreate()? {
            staleness.recreated();
            Ok(true)
        } else {
            staleness.request();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::RendererError;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        Recreate,
    }

    /// Scripted GPU: a slot's work completes when its fence is waited on,
    /// or when recreation idles the whole device.
    struct MockGpu {
        fence_signaled: Vec<bool>,
        in_flight: Vec<bool>,
        max_in_flight: usize,
        image_count: u32,
        next_image: u32,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<PresentStatus>,
        recreates: VecDeque<bool>,
        events: Vec<Event>,
    }

    impl MockGpu {
        fn new(slots: usize) -> Self {
            Self {
                fence_signaled: vec![true; slots],
                in_flight: vec![false; slots],
                max_in_flight: 0,
                image_count: 3,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                recreates: VecDeque::new(),
                events: Vec::new(),
            }
        }

        fn recreations(&self) -> usize {
            self.events.iter().filter(|e| **e == Event::Recreate).count()
        }
    }

    impl FrameBackend for MockGpu {
        type Slot = usize;

        fn wait(&mut self, &slot: &usize) -> RendererResult<()> {
            self.events.push(Event::Wait(slot));
            self.fence_signaled[slot] = true;
            self.in_flight[slot] = false;
            Ok(())
        }

        fn acquire(&mut self, &slot: &usize) -> RendererResult<Acquire> {
            self.events.push(Event::Acquire(slot));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                Acquire::Image { index, suboptimal: false }
            }))
        }

        fn reset(&mut self, &slot: &usize) -> RendererResult<()> {
            self.events.push(Event::Reset(slot));
            assert!(self.fence_signaled[slot], "reset of unsignaled fence on slot {}", slot);
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, &slot: &usize, image_index: u32) -> RendererResult<()> {
            self.events.push(Event::Record(slot, image_index));
            assert!(!self.in_flight[slot], "slot {} recorded while in flight", slot);
            Ok(())
        }

        fn submit(&mut self, &slot: &usize) -> RendererResult<()> {
            self.events.push(Event::Submit(slot));
            assert!(!self.fence_signaled[slot], "submit without fence reset on slot {}", slot);
            self.in_flight[slot] = true;
            let in_flight = self.in_flight.iter().filter(|f| **f).count();
            self.max_in_flight = self.max_in_flight.max(in_flight);
            Ok(())
        }

        fn present(&mut self, &slot: &usize, image_index: u32) -> RendererResult<PresentStatus> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentStatus::Presented))
        }

        fn recreate(&mut self) -> RendererResult<bool> {
            self.events.push(Event::Recreate);
            // Device idle: everything submitted has completed
            self.fence_signaled.iter_mut().for_each(|f| *f = true);
            self.in_flight.iter_mut().for_each(|f| *f = false);
            Ok(self.recreates.pop_front().unwrap_or(true))
        }
    }

    fn presented_slot(outcome: FrameOutcome) -> usize {
        match outcome {
            FrameOutcome::Presented { slot, .. } => slot,
            other => panic!("expected a presented frame, got {:?}", other),
        }
    }

    #[test]
    fn steady_state_alternates_slots() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);

        let slots: Vec<usize> = (0..6)
            .map(|_| presented_slot(frames.run_frame(&mut gpu).unwrap()))
            .collect();

        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(frames.frame_counter(), 6);
        assert_eq!(gpu.max_in_flight, 2);
        assert_eq!(gpu.recreations(), 0);
        assert_eq!(
            &gpu.events[..6],
            &[
                Event::Wait(0),
                Event::Acquire(0),
                Event::Reset(0),
                Event::Record(0, 0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
    }

    #[test]
    fn three_slots_bound_in_flight_work() {
        let mut frames = FrameLoop::new(vec![0, 1, 2]);
        let mut gpu = MockGpu::new(3);

        let slots: Vec<usize> = (0..7)
            .map(|_| presented_slot(frames.run_frame(&mut gpu).unwrap()))
            .collect();

        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(gpu.max_in_flight, 3);
    }

    #[test]
    fn out_of_date_acquire_keeps_the_slot() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);
        gpu.acquires.push_back(Acquire::OutOfDate);

        assert_eq!(frames.run_frame(&mut gpu).unwrap(), FrameOutcome::Retry);
        assert_eq!(frames.frame_counter(), 0);
        assert_eq!(
            gpu.events,
            vec![Event::Wait(0), Event::Acquire(0), Event::Recreate]
        );

        // Same slot again; its fence was never reset so the wait succeeds
        assert_eq!(presented_slot(frames.run_frame(&mut gpu).unwrap()), 0);
        assert_eq!(frames.frame_counter(), 1);
        assert_eq!(gpu.recreations(), 1);
    }

    #[test]
    fn stale_present_recreates_and_advances() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);
        gpu.presents.push_back(PresentStatus::Stale);

        assert_eq!(
            frames.run_frame(&mut gpu).unwrap(),
            FrameOutcome::Presented { slot: 0, image_index: 0, recreated: true }
        );
        assert_eq!(frames.frame_counter(), 1);
        assert_eq!(gpu.events.last(), Some(&Event::Recreate));

        assert_eq!(presented_slot(frames.run_frame(&mut gpu).unwrap()), 1);
        assert_eq!(gpu.recreations(), 1);
    }

    #[test]
    fn second_suboptimal_acquire_recreates() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);
        gpu.acquires.extend([
            Acquire::Image { index: 0, suboptimal: true },
            Acquire::Image { index: 1, suboptimal: false },
            Acquire::Image { index: 2, suboptimal: true },
            Acquire::Image { index: 0, suboptimal: true },
        ]);

        let recreated: Vec<bool> = (0..4)
            .map(|_| match frames.run_frame(&mut gpu).unwrap() {
                FrameOutcome::Presented { recreated, .. } => recreated,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        // A clean acquire in between resets the streak
        assert_eq!(recreated, vec![false, false, false, true]);
        assert_eq!(gpu.recreations(), 1);
    }

    #[test]
    fn resize_request_runs_before_the_wait() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);

        frames.request_recreate();
        assert!(frames.staleness.is_requested());

        let outcome = frames.run_frame(&mut gpu).unwrap();
        assert!(matches!(outcome, FrameOutcome::Presented { slot: 0, recreated: true, .. }));
        assert_eq!(&gpu.events[..2], &[Event::Recreate, Event::Wait(0)]);
        assert!(!frames.staleness.is_requested());
    }

    #[test]
    fn minimized_window_suspends_until_area_returns() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);
        gpu.recreates.extend([false, false, true]);

        frames.request_recreate();
        assert_eq!(frames.run_frame(&mut gpu).unwrap(), FrameOutcome::Suspended);
        assert_eq!(frames.run_frame(&mut gpu).unwrap(), FrameOutcome::Suspended);
        assert_eq!(gpu.events, vec![Event::Recreate, Event::Recreate]);
        assert_eq!(frames.frame_counter(), 0);

        assert_eq!(presented_slot(frames.run_frame(&mut gpu).unwrap()), 0);
        assert_eq!(gpu.recreations(), 3);
    }

    #[test]
    fn out_of_date_while_minimizing_suspends() {
        let mut frames = FrameLoop::new(vec![0, 1]);
        let mut gpu = MockGpu::new(2);
        gpu.acquires.push_back(Acquire::OutOfDate);
        gpu.recreates.push_back(false);

        assert_eq!(frames.run_frame(&mut gpu).unwrap(), FrameOutcome::Suspended);
        assert!(frames.staleness.is_requested());
    }

    #[test]
    fn backend_errors_propagate() {
        struct LostDevice;

        impl FrameBackend for LostDevice {
            type Slot = ();

            fn wait(&mut self, _: &()) -> RendererResult<()> {
                Err(RendererError::Submission {
                    op: "vkWaitForFences",
                    result: vk::Result::ERROR_DEVICE_LOST,
                })
            }
            fn acquire(&mut self, _: &()) -> RendererResult<Acquire> {
                unreachable!()
            }
            fn reset(&mut self, _: &()) -> RendererResult<()> {
                unreachable!()
            }
            fn record(&mut self, _: &(), _: u32) -> RendererResult<()> {
                unreachable!()
            }
            fn submit(&mut self, _: &()) -> RendererResult<()> {
                unreachable!()
            }
            fn present(&mut self, _: &(), _: u32) -> RendererResult<PresentStatus> {
                unreachable!()
            }
            fn recreate(&mut self) -> RendererResult<bool> {
                unreachable!()
            }
        }

        let mut frames = FrameLoop::new(vec![()]);
        let err = frames.run_frame(&mut LostDevice).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(frames.frame_counter(), 0);
    }

    #[test]
    fn ring_wraps_modulo_slot_count() {
        let mut ring = FrameRing::new(vec!['a', 'b', 'c']);
        let visited: Vec<char> = (0..5)
            .map(|_| {
                let slot = ring.slots()[ring.current()];
                ring.advance();
                slot
            })
            .collect();
        assert_eq!(visited, vec!['a', 'b', 'c', 'a', 'b']);
        assert_eq!(ring.slots().len(), 3);
    }
}
