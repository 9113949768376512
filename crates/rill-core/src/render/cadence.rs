//! Character cadence buffering.
//!
//! Rendering every delta as it arrives janks on bursty networks and lets
//! the structure tracker see torn tokens; rendering only at stream end
//! kills the live-typing feel. The middle path is a per-channel queue of
//! not-yet-displayed characters drained on a fixed tick with an adaptive
//! batch size: slow arrival keeps the one-character typing illusion, a
//! deep queue catches up without growing unboundedly.
//!
//! The drain tick itself is owned by the coordinator, which keeps this
//! module free of timers and directly testable.

use std::collections::VecDeque;

use rill_types::Channel;

use crate::config::CadenceConfig;

/// Outcome of one drain tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Channels whose committed text grew this tick, in channel order.
    pub updated: Vec<Channel>,
    /// Channels that tripped the stall detector this tick.
    pub stalled: Vec<Channel>,
}

#[derive(Debug, Default)]
struct ChannelQueue {
    pending: VecDeque<char>,
    committed: String,
    /// Consecutive ticks where the queue was non-empty but nothing reached
    /// the committed output.
    no_progress_ticks: u32,
}

/// Bounded producer/consumer queue with adaptive drain batching.
#[derive(Debug)]
pub struct CadenceBuffer {
    config: CadenceConfig,
    queues: [ChannelQueue; 2],
    stopped: bool,
}

impl CadenceBuffer {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            queues: [ChannelQueue::default(), ChannelQueue::default()],
            stopped: false,
        }
    }

    fn queue(&self, channel: Channel) -> &ChannelQueue {
        &self.queues[channel as usize]
    }

    fn queue_mut(&mut self, channel: Channel) -> &mut ChannelQueue {
        &mut self.queues[channel as usize]
    }

    /// Enqueues text for a channel. Ignored after `stop`.
    pub fn push(&mut self, channel: Channel, text: &str) {
        if self.stopped {
            return;
        }
        self.queue_mut(channel).pending.extend(text.chars());
    }

    /// Characters waiting to be released for a channel.
    pub fn queue_len(&self, channel: Channel) -> usize {
        self.queue(channel).pending.len()
    }

    /// Full committed text for a channel.
    pub fn committed(&self, channel: Channel) -> &str {
        &self.queue(channel).committed
    }

    /// True when every queue has been drained.
    pub fn is_drained(&self) -> bool {
        self.queues.iter().all(|q| q.pending.is_empty())
    }

    /// Appends text directly to the committed output, bypassing the queue.
    /// Used for the stopped-by-user marker, which must be visible even
    /// though pending characters were discarded.
    pub fn append_committed(&mut self, channel: Channel, text: &str) {
        self.queue_mut(channel).committed.push_str(text);
    }

    /// Runs one drain tick across all channels.
    pub fn drain_tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.stopped {
            return report;
        }

        for channel in Channel::ALL {
            let small = self.config.small_queue;
            let large = self.config.large_queue;
            let max_batch = self.config.max_batch;
            let stall_ticks = self.config.stall_ticks;

            let queue = self.queue_mut(channel);
            if queue.pending.is_empty() {
                queue.no_progress_ticks = 0;
                continue;
            }

            // Stall detection: the committed output failed to advance on
            // enough consecutive ticks despite waiting characters. A larger
            // emergency batch breaks the freeze.
            let mut batch = adaptive_batch(queue.pending.len(), small, large, max_batch);
            if queue.no_progress_ticks >= stall_ticks {
                batch = emergency_batch(max_batch);
                queue.no_progress_ticks = 0;
                report.stalled.push(channel);
            }

            let released = release(queue, batch);
            if released > 0 {
                queue.no_progress_ticks = 0;
                report.updated.push(channel);
            } else {
                queue.no_progress_ticks += 1;
            }
        }

        report
    }

    /// Drains every queue synchronously, bypassing the adaptive schedule.
    /// Returns the channels that changed.
    pub fn flush_all(&mut self) -> Vec<Channel> {
        let mut updated = Vec::new();
        for channel in Channel::ALL {
            let queue = self.queue_mut(channel);
            let len = queue.pending.len();
            if len > 0 {
                release(queue, len);
                queue.no_progress_ticks = 0;
                updated.push(channel);
            }
        }
        updated
    }

    /// Halts draining and discards everything still queued. Unlike
    /// `flush_all`, undisplayed text is gone: a stopped turn ends at the
    /// point of interruption.
    pub fn stop(&mut self) {
        self.stopped = true;
        for queue in &mut self.queues {
            queue.pending.clear();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

fn release(queue: &mut ChannelQueue, batch: usize) -> usize {
    let take = batch.min(queue.pending.len());
    for _ in 0..take {
        if let Some(c) = queue.pending.pop_front() {
            queue.committed.push(c);
        }
    }
    take
}

/// Batch size scaled by queue depth: one character while the queue is
/// shallow, growing linearly to the cap once it passes the thresholds.
fn adaptive_batch(queue_len: usize, small: usize, large: usize, max_batch: usize) -> usize {
    if queue_len == 0 {
        0
    } else if queue_len <= small {
        1.min(max_batch)
    } else if queue_len >= large || large <= small {
        max_batch
    } else {
        let span = large - small;
        let over = queue_len - small;
        (1 + over * max_batch.saturating_sub(1) / span).min(max_batch)
    }
}

fn emergency_batch(max_batch: usize) -> usize {
    (max_batch * 4).max(8)
}
