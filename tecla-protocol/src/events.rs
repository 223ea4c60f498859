//! イベントレジストリ
//!
//! エージェントからの非同期通知を、サービスごとに登録されたリスナーへ
//! 登録順に配送します。

use crate::error::ListenerError;
use crate::value::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// イベントリスナー
pub trait EventListener: Send + Sync {
    /// イベントを受け取る
    ///
    /// # Arguments
    /// * `name` - イベント名（例: `contextAdded`）
    /// * `args` - イベント引数
    fn event(&self, name: &str, args: &[Value]) -> Result<(), ListenerError>;
}

/// リスナー登録ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    services: HashMap<String, Vec<(ListenerId, Arc<dyn EventListener>)>>,
}

/// サービス名ごとのリスナー表
#[derive(Default)]
pub struct EventRegistry {
    state: Mutex<RegistryState>,
}

fn same_listener(a: &Arc<dyn EventListener>, b: &Arc<dyn EventListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// リスナーを登録する
    ///
    /// 同じリスナー（同じ `Arc`）を同じサービスに二度登録した場合は既存のIDを返します。
    pub fn add(&self, service: &str, listener: Arc<dyn EventListener>) -> ListenerId {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, _)) = state
            .services
            .get(service)
            .and_then(|list| list.iter().find(|(_, l)| same_listener(l, &listener)))
        {
            return *id;
        }

        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state
            .services
            .entry(service.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// リスナーの登録を解除する
    pub fn remove(&self, service: &str, id: ListenerId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = state.services.get_mut(service) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            state.services.remove(service);
        }
        removed
    }

    pub fn listener_count(&self, service: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.services.get(service).map_or(0, Vec::len)
    }

    /// イベントを配送する
    ///
    /// 配送中はロックを保持しません。失敗・パニックしたリスナーは記録だけして
    /// 後続のリスナーへの配送を続けます。戻り値は正常に処理したリスナーの数です。
    pub fn dispatch(&self, service: &str, name: &str, args: &[Value]) -> usize {
        let snapshot: Vec<(ListenerId, Arc<dyn EventListener>)> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.services.get(service) {
                Some(list) => list.clone(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            debug!("No listeners for event {}.{}", service, name);
            return 0;
        }

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.event(name, args))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    error!("Listener {:?} failed on {}.{}: {}", id, service, name, err);
                }
                Err(payload) => {
                    error!(
                        "Listener {:?} panicked on {}.{}: {}",
                        id,
                        service,
                        name,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventListener for Recorder {
        fn event(&self, name: &str, _args: &[Value]) -> Result<(), ListenerError> {
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, name));
            Ok(())
        }
    }

    struct Failing;

    impl EventListener for Failing {
        fn event(&self, _name: &str, _args: &[Value]) -> Result<(), ListenerError> {
            Err(ListenerError::new("bad event"))
        }
    }

    struct Panicking;

    impl EventListener for Panicking {
        fn event(&self, _name: &str, _args: &[Value]) -> Result<(), ListenerError> {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add("Registers", Arc::new(Recorder { tag: "a", log: log.clone() }));
        registry.add("Registers", Arc::new(Recorder { tag: "b", log: log.clone() }));

        assert_eq!(registry.dispatch("Registers", "contextChanged", &[]), 2);
        assert_eq!(registry.dispatch("Symbols", "contextChanged", &[]), 0);
        assert_eq!(*log.lock().unwrap(), vec!["a:contextChanged", "b:contextChanged"]);
    }

    #[test]
    fn test_duplicate_registration_returns_same_id() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn EventListener> = Arc::new(Recorder { tag: "a", log: log.clone() });

        let first = registry.add("Breakpoints", listener.clone());
        let second = registry.add("Breakpoints", listener.clone());
        assert_eq!(first, second);
        assert_eq!(registry.listener_count("Breakpoints"), 1);

        registry.dispatch("Breakpoints", "status", &[]);
        assert_eq!(log.lock().unwrap().len(), 1);

        assert!(registry.remove("Breakpoints", first));
        assert!(!registry.remove("Breakpoints", first));
    }

    #[test]
    fn test_faulting_listener_does_not_stop_delivery() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add("Breakpoints", Arc::new(Failing));
        registry.add("Breakpoints", Arc::new(Panicking));
        registry.add("Breakpoints", Arc::new(Recorder { tag: "last", log: log.clone() }));

        assert_eq!(registry.dispatch("Breakpoints", "contextRemoved", &[]), 1);
        assert_eq!(*log.lock().unwrap(), vec!["last:contextRemoved"]);
    }
}
