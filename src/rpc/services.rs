//! Capability interfaces exposed by the owning application.
//!
//! A script bound to owner `com.example` reaches `com.example.app` and
//! `com.example.input`. The application process implements the traits and
//! registers them with [`app_service`] / [`input_service`]; the script side
//! talks to them through [`RemoteApp`] / [`RemoteInput`].

use std::sync::Arc;

use tokio::runtime::Handle;

use super::client::ServiceProxy;
use super::registry::Service;
use super::value::{FromValue, Value};
use super::RpcError;

pub const APP_SUFFIX: &str = "app";
pub const INPUT_SUFFIX: &str = "input";

/// `<owner>.<suffix>`
pub fn service_name(owner: &str, suffix: &str) -> String {
    format!("{owner}.{suffix}")
}

/// Application-level helpers: notifications and persisted settings.
pub trait AppService: Send + Sync {
    fn toast(&self, text: &str) -> Result<(), RpcError>;

    fn get_config(&self, name: &str) -> Result<Option<String>, RpcError>;

    fn save_config(&self, name: &str, value: &str) -> Result<(), RpcError>;
}

/// Text entry through the application's input method.
pub trait InputService: Send + Sync {
    fn input(&self, text: &str) -> Result<(), RpcError>;

    fn clear(&self, before: i64, after: i64) -> Result<(), RpcError>;
}

/// Method table for an [`AppService`] implementation.
pub fn app_service(owner: &str, target: Arc<dyn AppService>) -> Service {
    let toast = Arc::clone(&target);
    let get = Arc::clone(&target);
    Service::builder(service_name(owner, APP_SUFFIX))
        .method1("toast", move |text: String| toast.toast(&text))
        .method1("get_config", move |name: String| get.get_config(&name))
        .method2("save_config", move |name: String, value: String| {
            target.save_config(&name, &value)
        })
        .build()
}

/// Method table for an [`InputService`] implementation.
pub fn input_service(owner: &str, target: Arc<dyn InputService>) -> Service {
    let input = Arc::clone(&target);
    Service::builder(service_name(owner, INPUT_SUFFIX))
        .method1("input", move |text: String| input.input(&text))
        .method2("clear", move |before: i64, after: i64| target.clear(before, after))
        .build()
}

/// Blocking proxy bound to a runtime handle.
///
/// Used from script threads, which run on the blocking pool.
pub struct BlockingProxy {
    proxy: ServiceProxy,
    runtime: Handle,
}

impl BlockingProxy {
    pub const fn new(proxy: ServiceProxy, runtime: Handle) -> Self {
        Self { proxy, runtime }
    }

    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.proxy.call_blocking(&self.runtime, method, args)
    }

    fn call_as<T: FromValue>(&self, method: &str, args: &[Value]) -> Result<T, RpcError> {
        T::from_value(self.call(method, args)?)
    }
}

/// [`AppService`] backed by a remote process.
pub struct RemoteApp(pub BlockingProxy);

impl AppService for RemoteApp {
    fn toast(&self, text: &str) -> Result<(), RpcError> {
        self.0.call("toast", &[text.into()]).map(drop)
    }

    fn get_config(&self, name: &str) -> Result<Option<String>, RpcError> {
        match self.0.call("get_config", &[name.into()])? {
            Value::Unit => Ok(None),
            other => String::from_value(other).map(Some),
        }
    }

    fn save_config(&self, name: &str, value: &str) -> Result<(), RpcError> {
        self.0.call_as("save_config", &[name.into(), value.into()])
    }
}

/// [`InputService`] backed by a remote process.
pub struct RemoteInput(pub BlockingProxy);

impl InputService for RemoteInput {
    fn input(&self, text: &str) -> Result<(), RpcError> {
        self.0.call_as("input", &[text.into()])
    }

    fn clear(&self, before: i64, after: i64) -> Result<(), RpcError> {
        self.0.call_as("clear", &[Value::Int(before), Value::Int(after)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::server::bind_service;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryApp {
        toasts: Mutex<Vec<String>>,
        config: Mutex<HashMap<String, String>>,
    }

    impl AppService for MemoryApp {
        fn toast(&self, text: &str) -> Result<(), RpcError> {
            self.toasts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn get_config(&self, name: &str) -> Result<Option<String>, RpcError> {
            Ok(self.config.lock().unwrap().get(name).cloned())
        }

        fn save_config(&self, name: &str, value: &str) -> Result<(), RpcError> {
            self.config
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    #[test]
    fn service_names_join_owner_and_suffix() {
        assert_eq!(service_name("com.example", APP_SUFFIX), "com.example.app");
        assert_eq!(service_name("com.example", INPUT_SUFFIX), "com.example.input");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_app_reaches_local_implementation() {
        let dir = tempfile::tempdir().unwrap();
        let app = Arc::new(MemoryApp::default());
        let _handle = bind_service(dir.path(), app_service("com.example", app.clone()))
            .await
            .unwrap();

        let proxy = ServiceProxy::unix(
            dir.path(),
            service_name("com.example", APP_SUFFIX),
            Duration::from_secs(5),
        );
        let remote = RemoteApp(BlockingProxy::new(proxy, Handle::current()));

        tokio::task::spawn_blocking(move || {
            remote.toast("hello").unwrap();
            assert_eq!(remote.get_config("volume").unwrap(), None);
            remote.save_config("volume", "7").unwrap();
            assert_eq!(remote.get_config("volume").unwrap().as_deref(), Some("7"));
        })
        .await
        .unwrap();

        assert_eq!(*app.toasts.lock().unwrap(), vec!["hello".to_string()]);
    }
}
