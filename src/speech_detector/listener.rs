use crate::detector::DetectionResult;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Detection events delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechDetectorEvent {
    KeywordDetected,
    EndPointDetected,
    SpeechDetected,
    /// Local command slot recognised by the device
    LocalCommand(u8),
}

impl SpeechDetectorEvent {
    pub fn from_result(result: DetectionResult) -> Option<Self> {
        match result {
            DetectionResult::None => None,
            DetectionResult::EndPoint => Some(SpeechDetectorEvent::EndPointDetected),
            DetectionResult::Speech => Some(SpeechDetectorEvent::SpeechDetected),
            DetectionResult::Keyword => Some(SpeechDetectorEvent::KeywordDetected),
            DetectionResult::Local(slot) => Some(SpeechDetectorEvent::LocalCommand(slot)),
        }
    }
}

/// Receives detection events on the listener worker thread
pub trait SpeechDetectorListener: Send + Sync {
    fn on_event(&self, event: SpeechDetectorEvent);
}

/// Non-owning set of listeners.
///
/// Registration can happen from any thread. Dispatch takes a snapshot of the
/// live listeners and calls them with the lock released, so a listener may
/// add or remove listeners from inside `on_event`.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Weak<dyn SpeechDetectorListener>>>,
}

fn same_listener(weak: &Weak<dyn SpeechDetectorListener>, listener: &Arc<dyn SpeechDetectorListener>) -> bool {
    // Compare data addresses only; vtable pointers may differ for one object
    std::ptr::eq(weak.as_ptr() as *const (), Arc::as_ptr(listener) as *const ())
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the listener is already registered
    pub fn add(&self, listener: &Arc<dyn SpeechDetectorListener>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|weak| same_listener(weak, listener)) {
            return false;
        }
        listeners.push(Arc::downgrade(listener));
        true
    }

    /// Returns false if the listener was never registered
    pub fn remove(&self, listener: &Arc<dyn SpeechDetectorListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|weak| !same_listener(weak, listener));
        listeners.len() != before
    }

    /// Number of listeners still alive
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every live listener, pruning dropped ones.
    /// Returns how many listeners were called.
    pub fn dispatch(&self, event: SpeechDetectorEvent) -> usize {
        let live: Vec<Arc<dyn SpeechDetectorListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        log::debug!("Dispatching {:?} to {} listener(s)", event, live.len());
        for listener in &live {
            listener.on_event(event);
        }
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SpeechDetectorEvent>>,
    }

    impl SpeechDetectorListener for Recorder {
        fn on_event(&self, event: SpeechDetectorEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn test_add_and_remove() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn SpeechDetectorListener> = Arc::new(Recorder::default());
        let other: Arc<dyn SpeechDetectorListener> = Arc::new(Recorder::default());

        assert!(registry.add(&listener));
        assert!(!registry.add(&listener));
        assert!(registry.add(&other));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&listener));
        assert!(!registry.remove(&listener));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dispatch_reaches_every_listener() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let a: Arc<dyn SpeechDetectorListener> = first.clone();
        let b: Arc<dyn SpeechDetectorListener> = second.clone();
        registry.add(&a);
        registry.add(&b);

        assert_eq!(registry.dispatch(SpeechDetectorEvent::KeywordDetected), 2);
        assert_eq!(*first.events.lock(), vec![SpeechDetectorEvent::KeywordDetected]);
        assert_eq!(*second.events.lock(), vec![SpeechDetectorEvent::KeywordDetected]);
    }

    #[test]
    fn test_dropped_listeners_are_pruned() {
        let registry = ListenerRegistry::new();
        let kept: Arc<dyn SpeechDetectorListener> = Arc::new(Recorder::default());
        {
            let dropped: Arc<dyn SpeechDetectorListener> = Arc::new(Recorder::default());
            registry.add(&dropped);
        }
        registry.add(&kept);

        assert_eq!(registry.dispatch(SpeechDetectorEvent::EndPointDetected), 1);
        assert_eq!(registry.listeners.lock().len(), 1);
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(SpeechDetectorEvent::from_result(DetectionResult::None), None);
        assert_eq!(
            SpeechDetectorEvent::from_result(DetectionResult::Local(7)),
            Some(SpeechDetectorEvent::LocalCommand(7))
        );
        assert_eq!(
            SpeechDetectorEvent::from_result(DetectionResult::Speech),
            Some(SpeechDetectorEvent::SpeechDetected)
        );
    }
}
