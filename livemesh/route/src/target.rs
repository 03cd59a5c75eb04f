use crate::Endpoint;
use ahash::AHashSet;
use std::sync::Arc;
use tracing::trace;

/// The candidate endpoints for a single invocation.
///
/// A target starts with the full candidate set returned by discovery and is
/// narrowed by each routing stage. It never holds an endpoint that was not in
/// the original candidate set.
#[derive(Clone, Debug)]
pub struct RouteTarget {
    original: Arc<[Endpoint]>,
    version: u64,
    endpoints: Vec<Endpoint>,
    matched: Option<usize>,
}

// === impl RouteTarget ===

impl RouteTarget {
    pub fn new(original: Arc<[Endpoint]>) -> Self {
        Self::with_version(original, 0)
    }

    /// Creates a target from a discovery snapshot. The version identifies the
    /// snapshot so that per-endpoint state can be swept only when it changes.
    pub fn with_version(original: Arc<[Endpoint]>, version: u64) -> Self {
        Self {
            endpoints: original.to_vec(),
            original,
            version,
            matched: None,
        }
    }

    pub fn original(&self) -> &Arc<[Endpoint]> {
        &self.original
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The number of endpoints matched by the most recent filter, if any.
    pub fn matched(&self) -> Option<usize> {
        self.matched
    }

    /// Returns the only remaining candidate.
    pub fn single(&self) -> Option<&Endpoint> {
        match self.endpoints.as_slice() {
            [ep] => Some(ep),
            _ => None,
        }
    }

    /// Removes candidates that do not satisfy `predicate`, keeping at most
    /// `limit` of the matches.
    ///
    /// When `allow_empty_fallback` is set and nothing matches, the candidates
    /// are left untouched. Returns the number of matching candidates.
    pub fn filter<F>(
        &mut self,
        mut predicate: F,
        limit: Option<usize>,
        allow_empty_fallback: bool,
    ) -> usize
    where
        F: FnMut(&Endpoint) -> bool,
    {
        let matched = self.endpoints.iter().filter(|&ep| predicate(ep)).count();
        self.matched = Some(matched);
        if matched == 0 && allow_empty_fallback {
            trace!(
                candidates = self.endpoints.len(),
                "No candidates matched; keeping all"
            );
            return 0;
        }

        let limit = limit.unwrap_or(usize::MAX);
        let mut kept = 0;
        self.endpoints.retain(|ep| {
            if kept < limit && predicate(ep) {
                kept += 1;
                true
            } else {
                false
            }
        });
        trace!(matched, kept, "Filtered candidates");
        matched
    }

    /// Narrows the candidates to exactly one endpoint picked by `selector`,
    /// which returns an index into the current candidates.
    pub fn choose<F>(&mut self, selector: F) -> Option<Endpoint>
    where
        F: FnOnce(&[Endpoint]) -> Option<usize>,
    {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = selector(&self.endpoints)?;
        if idx >= self.endpoints.len() {
            return None;
        }
        let chosen = self.endpoints.swap_remove(idx);
        self.endpoints.clear();
        self.endpoints.push(chosen.clone());
        Some(chosen)
    }

    /// Replaces the candidates with `candidates`, discarding any endpoint that
    /// is not part of the original set.
    pub fn reset_to(&mut self, candidates: impl IntoIterator<Item = Endpoint>) {
        let known = self
            .original
            .iter()
            .map(|ep| ep.id().clone())
            .collect::<AHashSet<_>>();
        self.endpoints = candidates
            .into_iter()
            .filter(|ep| known.contains(ep.id()))
            .collect();
        self.matched = None;
    }

    /// Restores the original candidate set.
    pub fn reset(&mut self) {
        self.endpoints = self.original.to_vec();
        self.matched = None;
    }
}
