//! Template Cache: parses [`crate::loader::Loader`] text into [`crate::ast::Template`]s
//! and keeps them around keyed by name, with mtime-based freshness and
//! single-flight coalescing of concurrent parses of the same key.
//!
//! Grounded on the teacher's `Executor`/`Promise` pattern (`database.rs`):
//! a `Mutex`-guarded map of slots, with a `Condvar` so a thread that finds an
//! in-progress parse waits on it rather than racing to parse a duplicate.
//! Here the "job" is always "parse one named template", so the machinery
//! collapses to a single map rather than the teacher's generic job queue.

use std::sync::{Arc, Condvar, Mutex};

use fnv::FnvHashMap;

use crate::ast::Template;
use crate::error::{Error, Result};
use crate::loader::{Freshness, Loader};
use crate::parser;

enum Slot {
    /// Another thread is currently parsing this name; waiters block on the
    /// cache's condvar until it transitions to `Done`.
    InProgress,
    Done(std::result::Result<(Arc<Template>, Freshness), Error>),
}

pub struct Cache {
    loader: Arc<dyn Loader>,
    slots: Mutex<FnvHashMap<String, Slot>>,
    cond: Condvar,
}

impl Cache {
    pub fn new(loader: Arc<dyn Loader>) -> Self {
        Cache { loader, slots: Mutex::new(FnvHashMap::default()), cond: Condvar::new() }
    }

    /// Raw, unparsed source text for `#include`, which splices file content
    /// verbatim without treating it as a template.
    pub fn load_text(&self, name: &str) -> Result<Arc<str>> {
        self.loader.load_text(name).map(|t| t.source)
    }

    /// Parsed, possibly-cached template for `#parse`/`#evaluate`.
    pub fn get_template(&self, name: &str) -> Result<Arc<Template>> {
        loop {
            let mut guard = self.slots.lock().unwrap();
            match guard.get(name) {
                Some(Slot::InProgress) => {
                    guard = self.cond.wait(guard).unwrap();
                    drop(guard);
                    continue;
                }
                Some(Slot::Done(Ok((template, freshness)))) => {
                    let template = template.clone();
                    let freshness = *freshness;
                    drop(guard);
                    if matches!(freshness, Freshness::Static) {
                        log::trace!("cache hit (static) for {name}");
                        return Ok(template);
                    }
                    // Stat the file before trusting the cached parse; cheap
                    // relative to a reparse.
                    let loaded = self.loader.load_text(name)?;
                    if loaded.freshness == freshness {
                        log::trace!("cache hit for {name}");
                        return Ok(template);
                    }
                    log::debug!("cache stale for {name}, reparsing");
                    if self.claim_slot(name) {
                        return self.parse_and_store(name, loaded.source, loaded.freshness);
                    }
                    // Someone else claimed it first; loop and wait.
                    continue;
                }
                Some(Slot::Done(Err(e))) => {
                    let e = e.clone();
                    return Err(e);
                }
                None => {
                    guard.insert(name.to_string(), Slot::InProgress);
                    drop(guard);
                    let loaded = match self.loader.load_text(name) {
                        Ok(l) => l,
                        Err(e) => {
                            self.store(name, Err(e.clone()));
                            return Err(e);
                        }
                    };
                    return self.parse_and_store(name, loaded.source, loaded.freshness);
                }
            }
        }
    }

    /// Attempts to transition an existing `Done` slot back to `InProgress`,
    /// the single-flight gate before a reparse. Returns `false` if another
    /// thread already won the race.
    fn claim_slot(&self, name: &str) -> bool {
        let mut guard = self.slots.lock().unwrap();
        match guard.get(name) {
            Some(Slot::Done(_)) => {
                guard.insert(name.to_string(), Slot::InProgress);
                true
            }
            _ => false,
        }
    }

    fn parse_and_store(&self, name: &str, source: std::sync::Arc<str>, freshness: Freshness) -> Result<Arc<Template>> {
        let result = parser::parse(&source, Some(std::sync::Arc::from(name)));
        match result {
            Ok(template) => {
                let template = Arc::new(template);
                self.store(name, Ok((template.clone(), freshness)));
                Ok(template)
            }
            Err(e) => {
                self.store(name, Err(e.clone()));
                Err(e)
            }
        }
    }

    fn store(&self, name: &str, result: std::result::Result<(Arc<Template>, Freshness), Error>) {
        let mut guard = self.slots.lock().unwrap();
        guard.insert(name.to_string(), Slot::Done(result));
        drop(guard);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StringLoader;
    use std::sync::Arc;

    #[test]
    fn caches_parsed_template_across_calls() {
        let mut loader = StringLoader::new();
        loader.insert("greet.vm", "hello $name");
        let cache = Cache::new(Arc::new(loader));
        let a = cache.get_template("greet.vm").unwrap();
        let b = cache.get_template("greet.vm").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_template_is_not_found() {
        let cache = Cache::new(Arc::new(crate::loader::NullLoader));
        let err = cache.get_template("nope.vm").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn concurrent_lookups_single_flight_to_one_parse() {
        let mut loader = StringLoader::new();
        loader.insert("a.vm", "$x");
        let cache = Arc::new(Cache::new(Arc::new(loader)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_template("a.vm").unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }
}
