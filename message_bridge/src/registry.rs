//! Channel registries
//!
//! A registry maps channels to listeners (many per channel) and handlers (at
//! most one per channel). The process-wide registry is protected against
//! bulk removal; per-peer registries are not.

use crate::error::RegistryError;
use crate::event::{HandlerFn, ListenerFn};
use ipc::{is_reserved_channel, ListenerId, Listeners};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

struct HandlerEntry {
    handler: Rc<HandlerFn>,
    once: bool,
}

pub(crate) struct Registry {
    protected: bool,
    listeners: BTreeMap<String, Listeners<ListenerFn>>,
    handlers: HashMap<String, HandlerEntry>,
}

impl Registry {
    pub(crate) fn protected() -> Self {
        Self {
            protected: true,
            listeners: BTreeMap::new(),
            handlers: HashMap::new(),
        }
    }

    pub(crate) fn scoped() -> Self {
        Self {
            protected: false,
            ..Self::protected()
        }
    }

    pub(crate) fn add_listener(
        &mut self,
        channel: &str,
        listener: Rc<ListenerFn>,
        once: bool,
    ) -> ListenerId {
        let listeners = self.listeners.entry(channel.to_string()).or_default();
        if once {
            listeners.add_once(listener)
        } else {
            listeners.add(listener)
        }
    }

    pub(crate) fn remove_listener(&mut self, channel: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(channel) else {
            return false;
        };
        let removed = listeners.remove(id);
        if listeners.is_empty() {
            self.listeners.remove(channel);
        }
        removed
    }

    /// Clears one channel, or every channel when `channel` is `None`
    pub(crate) fn remove_all_listeners(&mut self, channel: Option<&str>) -> Result<(), RegistryError> {
        match channel {
            Some(channel) => {
                self.listeners.remove(channel);
                Ok(())
            }
            None if self.protected => Err(RegistryError::ProtectedRegistryMutation),
            None => {
                self.listeners.clear();
                Ok(())
            }
        }
    }

    pub(crate) fn listener_count(&self, channel: &str) -> usize {
        self.listeners.get(channel).map_or(0, Listeners::len)
    }

    /// Listeners to call for one emission, in registration order
    pub(crate) fn listeners_for(&mut self, channel: &str) -> Vec<Rc<ListenerFn>> {
        let Some(listeners) = self.listeners.get_mut(channel) else {
            return Vec::new();
        };
        let snapshot = listeners.snapshot();
        if listeners.is_empty() {
            self.listeners.remove(channel);
        }
        snapshot
    }

    /// Channels with at least one listener, framework channels excluded
    pub(crate) fn event_names(&self) -> impl Iterator<Item = &str> {
        self.listeners
            .keys()
            .map(String::as_str)
            .filter(|channel| !is_reserved_channel(channel))
    }

    pub(crate) fn add_handler(
        &mut self,
        channel: &str,
        handler: Rc<HandlerFn>,
        once: bool,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(channel) {
            return Err(RegistryError::DuplicateInvoker(channel.to_string()));
        }
        self.handlers
            .insert(channel.to_string(), HandlerEntry { handler, once });
        Ok(())
    }

    pub(crate) fn remove_handler(&mut self, channel: &str) -> bool {
        self.handlers.remove(channel).is_some()
    }

    pub(crate) fn has_handler(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    /// Looks up the handler for a call; one-shot handlers are removed
    pub(crate) fn take_handler(&mut self, channel: &str) -> Option<Rc<HandlerFn>> {
        let once = self.handlers.get(channel)?.once;
        if once {
            self.handlers.remove(channel).map(|entry| entry.handler)
        } else {
            self.handlers
                .get(channel)
                .map(|entry| Rc::clone(&entry.handler))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HandlerReply;
    use ipc::Value;

    fn listener() -> Rc<ListenerFn> {
        Rc::new(|_, _| Ok(()))
    }

    fn handler() -> Rc<HandlerFn> {
        Rc::new(|_, _| HandlerReply::Ready(Ok(Value::Null)))
    }

    #[test]
    fn test_second_handler_is_rejected() {
        let mut registry = Registry::protected();
        registry.add_handler("ping", handler(), false).unwrap();
        assert_eq!(
            registry.add_handler("ping", handler(), false),
            Err(RegistryError::DuplicateInvoker("ping".into()))
        );

        assert!(registry.remove_handler("ping"));
        registry.add_handler("ping", handler(), false).unwrap();
    }

    #[test]
    fn test_protected_registry_refuses_bulk_removal() {
        let mut registry = Registry::protected();
        registry.add_listener("a", listener(), false);
        registry.add_listener("b", listener(), false);

        assert_eq!(
            registry.remove_all_listeners(None),
            Err(RegistryError::ProtectedRegistryMutation)
        );
        assert_eq!(registry.listener_count("a"), 1);

        registry.remove_all_listeners(Some("a")).unwrap();
        assert_eq!(registry.listener_count("a"), 0);
        assert_eq!(registry.listener_count("b"), 1);
    }

    #[test]
    fn test_scoped_registry_allows_bulk_removal() {
        let mut registry = Registry::scoped();
        registry.add_listener("a", listener(), false);
        registry.remove_all_listeners(None).unwrap();
        assert_eq!(registry.event_names().count(), 0);
    }

    #[test]
    fn test_once_listener_fires_once() {
        let mut registry = Registry::protected();
        registry.add_listener("tick", listener(), true);
        registry.add_listener("tick", listener(), false);

        assert_eq!(registry.listeners_for("tick").len(), 2);
        assert_eq!(registry.listeners_for("tick").len(), 1);
        assert_eq!(registry.listener_count("tick"), 1);
    }

    #[test]
    fn test_once_handler_is_taken() {
        let mut registry = Registry::protected();
        registry.add_handler("init", handler(), true).unwrap();
        assert!(registry.take_handler("init").is_some());
        assert!(!registry.has_handler("init"));
        assert!(registry.take_handler("init").is_none());
    }

    #[test]
    fn test_event_names_hide_framework_channels() {
        let mut registry = Registry::protected();
        registry.add_listener("zeta", listener(), false);
        registry.add_listener("__bridge:context-release", listener(), false);
        registry.add_listener("alpha", listener(), false);

        let names: Vec<&str> = registry.event_names().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_remove_last_listener_drops_channel() {
        let mut registry = Registry::protected();
        let id = registry.add_listener("a", listener(), false);
        assert!(registry.remove_listener("a", id));
        assert!(!registry.remove_listener("a", id));
        assert_eq!(registry.event_names().count(), 0);
    }
}
