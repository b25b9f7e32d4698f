// Deferred destruction - frame-delayed resource teardown
//
// GPU work runs behind the host by up to frames-in-flight frames, so
// releasing a resource is recorded here and executed a few ticks later.

/// Default delay; covers the usual 2-3 frames in flight
pub const DEFAULT_DEFER: u32 = 3;

pub type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    callback: Callback,
    remaining: u32,
}

/// Ordered list of (callback, countdown) pairs, ticked once per frame
#[derive(Default)]
pub struct DeferQueue {
    entries: Vec<Entry>,
}

impl DeferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` to fire on the `frames`-th following tick.
    /// A delay of zero behaves like one.
    pub fn defer(&mut self, callback: impl FnOnce() + Send + 'static, frames: u32) {
        self.entries.push(Entry { callback: Box::new(callback), remaining: frames.max(1) });
    }

    /// Count every entry down by one and hand back the ones that expired.
    ///
    /// The caller runs the returned callbacks, usually after releasing
    /// whatever lock guards this queue.
    #[must_use]
    pub fn tick(&mut self) -> Vec<Callback> {
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                expired.push(entry.callback);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        expired
    }

    /// Take every entry regardless of its countdown (shutdown path)
    #[must_use]
    pub fn drain(&mut self) -> Vec<Callback> {
        self.entries.drain(..).map(|e| e.callback).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
