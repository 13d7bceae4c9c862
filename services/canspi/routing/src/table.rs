//! Fixed-capacity identifier filter table

use crate::router::{DispatchOutcome, DispatchStats, Disposition, ExtendedMatch, FrameHandler};
use crate::RoutingError;
use canspi_wire::DecodedFrame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Number of filter slots
pub const FILTER_CAPACITY: usize = 128;

/// One registered filter
#[derive(Clone)]
pub struct FilterEntry {
    /// Identifier pattern compared after masking
    pub pattern: u32,
    /// Mask applied to incoming identifiers
    pub mask: u32,
    /// Whether the filter targets extended identifiers
    pub extended: bool,
    handler: Arc<dyn FrameHandler>,
}

impl FilterEntry {
    /// Whether `id` falls inside this filter
    pub fn matches_id(&self, id: u32) -> bool {
        (id & self.mask) == self.pattern
    }
}

impl fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEntry")
            .field("pattern", &format_args!("0x{:08x}", self.pattern))
            .field("mask", &format_args!("0x{:08x}", self.mask))
            .field("extended", &self.extended)
            .finish()
    }
}

/// Ordered filter table mapping identifiers to handlers.
///
/// Filled during configuration through `&mut self`, then shared read-only with
/// the exchange loop. The first matching filter in registration order wins.
#[derive(Debug)]
pub struct FilterRegistry {
    entries: Vec<FilterEntry>,
    extended_match: ExtendedMatch,
    dispatched: AtomicU64,
    consumed: AtomicU64,
    forwarded: AtomicU64,
    unrecognized: AtomicU64,
}

impl FilterRegistry {
    /// Create an empty registry that ignores the extended flag when matching
    pub fn new() -> Self {
        Self::with_extended_match(ExtendedMatch::Ignore)
    }

    /// Create an empty registry with the given extended-flag policy
    pub fn with_extended_match(extended_match: ExtendedMatch) -> Self {
        Self {
            entries: Vec::with_capacity(FILTER_CAPACITY),
            extended_match,
            dispatched: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            unrecognized: AtomicU64::new(0),
        }
    }

    /// Register a filter and return its slot.
    ///
    /// Fails without adding anything once all slots are taken.
    pub fn register(
        &mut self,
        pattern: u32,
        mask: u32,
        extended: bool,
        handler: impl FrameHandler + 'static,
    ) -> Result<usize, RoutingError> {
        self.register_shared(pattern, mask, extended, Arc::new(handler))
    }

    /// Register a filter with a handler shared by several filters
    pub fn register_shared(
        &mut self,
        pattern: u32,
        mask: u32,
        extended: bool,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<usize, RoutingError> {
        if self.entries.len() >= FILTER_CAPACITY {
            return Err(RoutingError::TableFull {
                capacity: FILTER_CAPACITY,
            });
        }
        if pattern & !mask != 0 {
            debug!(
                "Filter pattern 0x{:08x} has bits outside mask 0x{:08x}; it can never match",
                pattern, mask
            );
        }

        let slot = self.entries.len();
        self.entries.push(FilterEntry {
            pattern,
            mask,
            extended,
            handler,
        });
        info!(
            "Registered filter slot {}: id=0x{:08x} mask=0x{:08x} ext={}",
            slot, pattern, mask, extended
        );
        Ok(slot)
    }

    /// Find the first filter matching `id` (and `extended`, when enforced)
    pub fn find(&self, id: u32, extended: bool) -> Option<(usize, &FilterEntry)> {
        self.entries.iter().enumerate().find(|(_, entry)| {
            entry.matches_id(id)
                && (self.extended_match == ExtendedMatch::Ignore || entry.extended == extended)
        })
    }

    /// Run the handler of the first matching filter.
    ///
    /// An unmatched frame is logged and dropped; it is never an error.
    pub fn dispatch(&self, decoded: &DecodedFrame) -> DispatchOutcome {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let frame = &decoded.frame;

        match self.find(frame.id, frame.extended) {
            Some((slot, entry)) => {
                let disposition = entry.handler.on_frame(decoded.channel, frame);
                match disposition {
                    Disposition::Consumed => self.consumed.fetch_add(1, Ordering::Relaxed),
                    Disposition::Forward => self.forwarded.fetch_add(1, Ordering::Relaxed),
                };
                DispatchOutcome::Handled { slot, disposition }
            }
            None => {
                self.unrecognized.fetch_add(1, Ordering::Relaxed);
                debug!("unknown can id=0x{:08x}", frame.id);
                DispatchOutcome::Unrecognized
            }
        }
    }

    /// Number of registered filters
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no filter is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered filters in slot order
    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    /// Extended-flag policy
    pub fn extended_match(&self) -> ExtendedMatch {
        self.extended_match
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
        }
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ForwardAll;
    use canspi_wire::CanFrame;
    use std::sync::atomic::AtomicUsize;

    fn decoded(id: u32, extended: bool) -> DecodedFrame {
        let mut frame = CanFrame::new(id, &[0xAB]).unwrap();
        frame.extended = extended;
        DecodedFrame { frame, channel: 0 }
    }

    #[test]
    fn test_mask_match_and_unrecognized() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let mut registry = FilterRegistry::new();
        let slot = registry
            .register(0x7E0, 0x7F0, false, move |_: u8, frame: &CanFrame| {
                assert_eq!(frame.id, 0x7E5);
                counter.fetch_add(1, Ordering::SeqCst);
                Disposition::Consumed
            })
            .unwrap();
        assert_eq!(slot, 0);

        assert_eq!(
            registry.dispatch(&decoded(0x7E5, false)),
            DispatchOutcome::Handled {
                slot: 0,
                disposition: Disposition::Consumed
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(
            registry.dispatch(&decoded(0x100, false)),
            DispatchOutcome::Unrecognized
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stats = registry.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.unrecognized, 1);
    }

    #[test]
    fn test_first_registered_wins() {
        let mut registry = FilterRegistry::new();
        registry
            .register(0x100, 0x700, false, |_: u8, _: &CanFrame| Disposition::Consumed)
            .unwrap();
        registry.register(0x123, 0x7FF, false, ForwardAll).unwrap();

        // Both match; slot 0 was registered first
        assert_eq!(
            registry.dispatch(&decoded(0x123, false)),
            DispatchOutcome::Handled {
                slot: 0,
                disposition: Disposition::Consumed
            }
        );
    }

    #[test]
    fn test_table_full() {
        let mut registry = FilterRegistry::new();
        for i in 0..FILTER_CAPACITY as u32 {
            registry.register(i, 0xFFFF_FFFF, false, ForwardAll).unwrap();
        }
        assert_eq!(
            registry.register(0x999, 0xFFFF_FFFF, false, ForwardAll),
            Err(RoutingError::TableFull {
                capacity: FILTER_CAPACITY
            })
        );
        assert_eq!(registry.len(), FILTER_CAPACITY);
    }

    #[test]
    fn test_extended_flag_ignored_by_default() {
        let mut registry = FilterRegistry::new();
        registry.register(0x123, 0x7FF, true, ForwardAll).unwrap();
        assert!(registry.dispatch(&decoded(0x123, false)).should_forward());
    }

    #[test]
    fn test_extended_flag_enforced() {
        let mut registry = FilterRegistry::with_extended_match(ExtendedMatch::Enforce);
        registry.register(0x123, 0x7FF, true, ForwardAll).unwrap();
        assert_eq!(
            registry.dispatch(&decoded(0x123, false)),
            DispatchOutcome::Unrecognized
        );
        assert!(registry.dispatch(&decoded(0x123, true)).should_forward());
    }

    #[test]
    fn test_shared_handler() {
        let handler: Arc<dyn FrameHandler> = Arc::new(ForwardAll);
        let mut registry = FilterRegistry::new();
        registry.register_shared(0x100, 0x7FF, false, handler.clone()).unwrap();
        registry.register_shared(0x200, 0x7FF, false, handler).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(0x200, false).map(|(slot, _)| slot), Some(1));

        let ids: Vec<u32> = registry.entries().iter().map(|entry| entry.pattern).collect();
        assert_eq!(ids, vec![0x100, 0x200]);
    }
}
