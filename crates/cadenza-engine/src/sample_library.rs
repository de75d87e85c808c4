//! Out-of-band sample cache keyed by path and loop mode.
//!
//! `request_sample` and `update_loaded_samples` run on the control
//! thread; `get_sample` is the only call made from the real-time path
//! and never blocks or allocates — it takes a non-blocking read of the
//! handle table and clones an `Arc`.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopMode {
    OneShot,
    Loop,
}

/// A decoded sample, produced by the loader callback.
#[derive(Debug, Clone)]
pub struct Sample {
    pub sample_rate: u32,
    pub data: Vec<f32>,
    pub loop_mode: LoopMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleHandle(u32);

/// Decodes a sample file. Returns `None` if the file cannot be loaded;
/// the handle then resolves to silence.
pub type SampleLoader = Box<dyn FnMut(&str, LoopMode) -> Option<Sample> + Send>;

struct Slot {
    path: Arc<str>,
    loop_mode: LoopMode,
    requested: bool,
}

pub struct SampleLibrary {
    loader: SampleLoader,
    by_key: AHashMap<(Arc<str>, LoopMode), SampleHandle>,
    slots: Vec<Slot>,
    /// Handle-indexed table read by the real-time path.
    loaded: RwLock<Vec<Option<Arc<Sample>>>>,
}

impl SampleLibrary {
    pub fn new(loader: SampleLoader) -> Self {
        Self {
            loader,
            by_key: AHashMap::new(),
            slots: Vec::new(),
            loaded: RwLock::new(Vec::new()),
        }
    }

    /// Registers interest in a sample for the next update cycle.
    /// Requests are deduplicated by path and loop mode, so repeated
    /// calls return the same handle.
    pub fn request_sample(&mut self, path: &str, loop_mode: LoopMode) -> SampleHandle {
        if let Some(&handle) = self.by_key.get(&(Arc::from(path), loop_mode)) {
            self.slots[handle.0 as usize].requested = true;
            return handle;
        }

        let path: Arc<str> = Arc::from(path);
        let handle = SampleHandle(self.slots.len() as u32);
        self.by_key.insert((Arc::clone(&path), loop_mode), handle);
        self.slots.push(Slot {
            path,
            loop_mode,
            requested: true,
        });
        self.loaded.write().unwrap().push(None);

        handle
    }

    /// Clears the request set. Call at the start of a request pass so
    /// `update_loaded_samples` can unload samples nothing asked for.
    pub fn clear_requests(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.requested = false;
        }
    }

    /// Loads newly requested samples and unloads ones absent from the
    /// most recent request set. Must be called off the real-time thread.
    pub fn update_loaded_samples(&mut self) {
        for (index, slot) in self.slots.iter().enumerate() {
            let is_loaded = self.loaded.read().unwrap()[index].is_some();

            if slot.requested && !is_loaded {
                let sample = (self.loader)(&slot.path, slot.loop_mode).map(Arc::new);
                self.loaded.write().unwrap()[index] = sample;
            } else if !slot.requested && is_loaded {
                self.loaded.write().unwrap()[index] = None;
            }
        }
    }

    /// Resolves a handle from the real-time path. Never blocks: if the
    /// table is momentarily write-locked by an update, this misses and
    /// returns `None` (silence) rather than stalling the audio thread.
    pub fn get_sample(&self, handle: SampleHandle) -> Option<Arc<Sample>> {
        let table = self.loaded.try_read().ok()?;
        table.get(handle.0 as usize)?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_library(loads: Arc<AtomicUsize>) -> SampleLibrary {
        SampleLibrary::new(Box::new(move |path, loop_mode| {
            loads.fetch_add(1, Ordering::AcqRel);
            Some(Sample {
                sample_rate: 48_000,
                data: vec![path.len() as f32; 4],
                loop_mode,
            })
        }))
    }

    #[test]
    fn requests_deduplicate_by_path_and_loop_mode() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut library = counting_library(Arc::clone(&loads));

        let a = library.request_sample("kick.wav", LoopMode::OneShot);
        let b = library.request_sample("kick.wav", LoopMode::OneShot);
        let c = library.request_sample("kick.wav", LoopMode::Loop);

        assert_eq!(a, b);
        assert_ne!(a, c);

        library.update_loaded_samples();
        assert_eq!(loads.load(Ordering::Acquire), 2);
    }

    #[test]
    fn unrequested_samples_are_unloaded_and_reloaded_on_demand() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut library = counting_library(Arc::clone(&loads));

        let handle = library.request_sample("loop.wav", LoopMode::Loop);
        library.update_loaded_samples();
        assert!(library.get_sample(handle).is_some());

        library.clear_requests();
        library.update_loaded_samples();
        assert!(library.get_sample(handle).is_none());

        assert_eq!(library.request_sample("loop.wav", LoopMode::Loop), handle);
        library.update_loaded_samples();
        assert!(library.get_sample(handle).is_some());
        assert_eq!(loads.load(Ordering::Acquire), 2);
    }

    #[test]
    fn failed_loads_resolve_to_silence() {
        let mut library = SampleLibrary::new(Box::new(|_, _| None));

        let handle = library.request_sample("missing.wav", LoopMode::OneShot);
        library.update_loaded_samples();

        assert!(library.get_sample(handle).is_none());
    }
}
