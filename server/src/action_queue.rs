//! Action frames and the per-user cursors that consume them.
//!
//! Frames live in a `VecDeque` addressed by a monotonically increasing
//! sequence number. The tail frame collects actions until the scheduler
//! closes it; closed frames are flushed to each user when that user's
//! [`FrameCursor`] reaches them and are retired from the front once no
//! cursor can reach them again.

use log::error;
use shared::w3gs::{self, leave_reason, IncomingAction};
use std::collections::VecDeque;
use std::ops::RangeInclusive;

/// Largest action sub-queue sent in one packet.
pub const MAX_SUBQUEUE_BYTES: usize = 1452;

/// Pause state change requested by an action inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameCallback {
    #[default]
    None,
    Pause,
    Resume,
}

/// One simulation tick worth of actions.
#[derive(Debug, Clone, Default)]
pub struct QueuedActionsFrame {
    pub callback: FrameCallback,
    pub pause_uid: Option<u8>,
    /// Serialized size of every action in the frame.
    pub buffer_size: usize,
    active: Vec<IncomingAction>,
    closed: Vec<Vec<IncomingAction>>,
    /// Users who left during this frame. Their notice follows the actions.
    pub leavers: Vec<u8>,
}

impl QueuedActionsFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the active sub-queue, sealing it first if it would grow
    /// past one packet.
    pub fn add_action(&mut self, action: IncomingAction) {
        let active_size: usize = self.active.iter().map(IncomingAction::wire_len).sum();
        if !self.active.is_empty() && active_size + action.wire_len() > MAX_SUBQUEUE_BYTES {
            self.close_active();
        }
        self.buffer_size += action.wire_len();
        self.active.push(action);
    }

    fn close_active(&mut self) {
        if !self.active.is_empty() {
            self.closed.push(std::mem::take(&mut self.active));
        }
    }

    pub fn add_leaver(&mut self, uid: u8) {
        if !self.leavers.contains(&uid) {
            self.leavers.push(uid);
        }
    }

    pub fn set_callback(&mut self, callback: FrameCallback, uid: u8) {
        self.callback = callback;
        self.pause_uid = Some(uid);
    }

    pub fn action_count(&self) -> usize {
        self.closed.iter().map(Vec::len).sum::<usize>() + self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.action_count() == 0 && self.leavers.is_empty()
    }

    fn sub_queues(&self) -> Vec<&[IncomingAction]> {
        let mut queues: Vec<&[IncomingAction]> = self.closed.iter().map(Vec::as_slice).collect();
        if !self.active.is_empty() {
            queues.push(&self.active);
        }
        queues
    }

    /// Wire form: `INCOMING_ACTION2` for every sub-queue but the last,
    /// `INCOMING_ACTION` for the last, then one leave notice per leaver.
    pub fn get_bytes(&self, send_interval: u16) -> Vec<u8> {
        let queues = self.sub_queues();
        let mut out = Vec::with_capacity(self.buffer_size + 16 * (queues.len() + 1));
        match queues.split_last() {
            None => out.extend(w3gs::send_incoming_action(send_interval, &[])),
            Some((last, rest)) => {
                for queue in rest {
                    out.extend(w3gs::send_incoming_action2(queue));
                }
                out.extend(w3gs::send_incoming_action(send_interval, last));
            }
        }
        for &uid in &self.leavers {
            out.extend(w3gs::send_playerleave_others(uid, leave_reason::LOST));
        }
        out
    }

    /// Appends `other` after this frame, keeping both frames' action order.
    pub fn merge_frame(&mut self, other: QueuedActionsFrame) {
        self.close_active();
        self.closed.extend(other.closed);
        self.active = other.active;
        self.buffer_size += other.buffer_size;
        for uid in other.leavers {
            self.add_leaver(uid);
        }
        if other.callback != FrameCallback::None {
            self.callback = other.callback;
            self.pause_uid = other.pause_uid;
        }
    }
}

/// Ring of frames addressed by sequence number.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    frames: VecDeque<QueuedActionsFrame>,
    head_seq: u64,
    current: u64,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionQueue {
    /// Starts with an open tail frame `1`; nothing is closed yet.
    pub fn new() -> Self {
        let mut frames = VecDeque::new();
        frames.push_back(QueuedActionsFrame::new());
        Self {
            frames,
            head_seq: 1,
            current: 0,
        }
    }

    /// Oldest frame still held.
    pub fn head_seq(&self) -> u64 {
        self.head_seq
    }

    /// Frame still collecting actions.
    pub fn tail_seq(&self) -> u64 {
        self.head_seq + self.frames.len() as u64 - 1
    }

    /// Newest closed frame, `0` before the first close.
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, seq: u64) -> Option<&QueuedActionsFrame> {
        let index = seq.checked_sub(self.head_seq)?;
        self.frames.get(index as usize)
    }

    pub fn tail_mut(&mut self) -> &mut QueuedActionsFrame {
        if self.frames.is_empty() {
            self.frames.push_back(QueuedActionsFrame::new());
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Seals the tail, opens a new one and returns the sealed sequence.
    pub fn close_tail(&mut self) -> u64 {
        self.current = self.tail_seq();
        self.frames.push_back(QueuedActionsFrame::new());
        self.current
    }

    /// Drops closed frames up to and including `through`.
    pub fn retire_through(&mut self, through: u64) -> usize {
        let mut retired = 0;
        while self.head_seq <= through && self.head_seq <= self.current && self.frames.len() > 1 {
            self.frames.pop_front();
            self.head_seq += 1;
            retired += 1;
        }
        retired
    }

    /// Serializes every frame `cursor` has pending and marks them sent.
    ///
    /// If any of them was already retired nothing is sent and the cursor's
    /// delivered watermark stays put.
    pub fn deliver(&self, cursor: &mut FrameCursor, latency: u16) -> Option<Vec<u8>> {
        let range = cursor.pending()?;
        let (first, last) = (*range.start(), *range.end());
        let Some(frame) = self.merged(range) else {
            error!(
                "frames {}..={} are gone: queue holds {}..={}, cursor at {}",
                first,
                last,
                self.head_seq,
                self.tail_seq(),
                cursor.position()
            );
            return None;
        };
        let interval = (u64::from(latency) * (last - first + 1)).min(u64::from(u16::MAX)) as u16;
        cursor.mark_delivered(last);
        Some(frame.get_bytes(interval))
    }

    /// Frames in `range` folded into one, in order.
    pub fn merged(&self, range: RangeInclusive<u64>) -> Option<QueuedActionsFrame> {
        let mut merged: Option<QueuedActionsFrame> = None;
        for seq in range {
            let frame = self.get(seq)?.clone();
            match merged.as_mut() {
                Some(acc) => acc.merge_frame(frame),
                None => merged = Some(frame),
            }
        }
        merged
    }
}

/// A user's position in the action queue.
///
/// `position` is the newest frame the user may receive; the distance to the
/// game's current frame is the user's ping-equalizer offset. `delivered` is
/// the newest frame actually sent, so every frame goes out exactly once even
/// while the position moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    position: u64,
    delivered: u64,
}

impl FrameCursor {
    pub fn at(current: u64) -> Self {
        Self {
            position: current,
            delivered: current,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn offset(&self, current: u64) -> u64 {
        current.saturating_sub(self.position)
    }

    /// Keeps the offset when the game closes a new frame.
    pub fn follow(&mut self, current: u64) {
        self.position = (self.position + 1).min(current);
    }

    /// Lags one more frame. Fails on the ring head.
    pub fn add_delay(&mut self, head_seq: u64) -> bool {
        if self.position <= head_seq {
            return false;
        }
        self.position -= 1;
        true
    }

    /// Lags one frame less. Fails on the game's current frame.
    pub fn sub_delay(&mut self, current: u64) -> bool {
        if self.position >= current {
            return false;
        }
        self.position += 1;
        true
    }

    /// Frames ready to send, oldest first.
    pub fn pending(&self) -> Option<RangeInclusive<u64>> {
        (self.position > self.delivered).then(|| self.delivered + 1..=self.position)
    }

    pub fn mark_delivered(&mut self, seq: u64) {
        self.delivered = self.delivered.max(seq);
    }

    /// Newest frame this cursor no longer needs.
    pub fn retire_bound(&self) -> u64 {
        self.delivered.min(self.position.saturating_sub(1))
    }
}
