//! Functions available to scripts.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map};
use tokio::runtime::Handle;
use tracing::debug;

use super::convert::{array_to_values, point, to_dynamic, to_value};
use super::{LogSink, StopSignal};
use crate::capability::{default_steps, Capabilities, Region, TouchAction};
use crate::compiler::{sources, Compiler, Runnable, Script, ScriptError};
use crate::rpc::services::{
    service_name, AppService, BlockingProxy, InputService, RemoteApp, RemoteInput, APP_SUFFIX,
    INPUT_SUFFIX,
};
use crate::rpc::{ServiceProxy, Value};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

const SLEEP_TICK: Duration = Duration::from_millis(20);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Unit name given to code passed to `evaluate`.
const EVAL_UNIT: &str = "eval";

/// Per-run state the script functions close over.
pub struct ScriptHost {
    pub(super) working_dir: PathBuf,
    pub(super) owner: Option<String>,
    pub(super) sink: Arc<dyn LogSink>,
    pub(super) capabilities: Capabilities,
    pub(super) socket_dir: PathBuf,
    pub(super) rpc_timeout: Duration,
    pub(super) runtime: Handle,
    pub(super) stop: StopSignal,
    pub(super) started: Instant,
}

impl ScriptHost {
    /// Relative paths are taken from the working directory.
    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Sleep in short ticks so a stopped generation ends the script promptly.
    fn sleep(&self, ms: i64) -> Result<(), ScriptError> {
        let deadline = Instant::now() + Duration::from_millis(u64::try_from(ms).unwrap_or(0));
        loop {
            if self.stop.is_stopped() {
                return Err(ScriptError::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(SLEEP_TICK));
        }
    }

    fn proxy(&self, suffix: &str) -> Result<BlockingProxy, ScriptError> {
        let owner = self
            .owner
            .as_deref()
            .ok_or_else(|| ScriptError::Runtime("no owner bound to this script".into()))?;
        let proxy = ServiceProxy::unix(&self.socket_dir, service_name(owner, suffix), self.rpc_timeout);
        Ok(BlockingProxy::new(proxy, self.runtime.clone()))
    }

    fn app(&self) -> Result<RemoteApp, ScriptError> {
        self.proxy(APP_SUFFIX).map(RemoteApp)
    }

    fn input(&self) -> Result<RemoteInput, ScriptError> {
        self.proxy(INPUT_SUFFIX).map(RemoteInput)
    }

    fn exec(&self, command: &str) -> Result<String, ScriptError> {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| ScriptError::Runtime(format!("exec {command}: {e}")))?;
        debug!(command, status = %output.status, "exec finished");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Body of a successful response, `()` on any failure.
    fn http<F>(&self, url: &str, build: F) -> Dynamic
    where
        F: FnOnce(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let fetched = self.runtime.block_on(async move {
            let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
            build(&client).send().await?.error_for_status()?.text().await
        });
        match fetched {
            Ok(body) => Dynamic::from(body),
            Err(e) => {
                debug!(url, error = %e, "http request failed");
                Dynamic::UNIT
            }
        }
    }

    /// Full-size screenshot at maximum quality.
    fn capture_screen(&self) -> anyhow::Result<Vec<u8>> {
        let device = &self.capabilities.device;
        let (width, height) = device.display_size();
        self.capabilities
            .screen
            .capture(device.rotation(), width, height, 100)
    }

    fn screenshot(&self, file: &str) -> bool {
        let path = self.resolve(file);
        match self.capture_screen().and_then(|bytes| Ok(std::fs::write(&path, bytes)?)) {
            Ok(()) => true,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "screenshot failed");
                false
            }
        }
    }

    fn find_pic(&self, file: &str, region: Region, similarity: f64) -> Dynamic {
        let Some(matcher) = self.capabilities.matcher.as_ref() else {
            debug!("find_pic without an image matcher");
            return Dynamic::UNIT;
        };
        let found = self.capture_screen().and_then(|screen| {
            let template = std::fs::read(self.resolve(file))?;
            matcher.find(&screen, &template, region, similarity)
        });
        match found {
            Ok(Some((x, y))) => point(x, y),
            Ok(None) => Dynamic::UNIT,
            Err(e) => {
                debug!(file, error = %e, "find_pic failed");
                Dynamic::UNIT
            }
        }
    }
}

fn runtime_error(e: impl std::fmt::Display) -> Box<EvalAltResult> {
    e.to_string().into()
}

fn upgrade(compiler: &Weak<Compiler>) -> Result<Arc<Compiler>, ScriptError> {
    compiler
        .upgrade()
        .ok_or_else(|| ScriptError::Runtime("compiler is no longer available".into()))
}

/// Install the script API on `engine`.
pub(super) fn register(engine: &mut Engine, host: &Arc<ScriptHost>, compiler: Weak<Compiler>) {
    register_output(engine, host);
    register_nested(engine, host, compiler);
    register_system(engine, host);
    register_files(engine, host);
    register_device(engine, host);
    register_services(engine, host);
}

fn register_output(engine: &mut Engine, host: &Arc<ScriptHost>) {
    let h = Arc::clone(host);
    engine.on_print(move |text| h.sink.emit(Value::Str(text.to_string())));

    engine.on_debug(|text, source, pos| {
        debug!(target: "script", source = source.unwrap_or("-"), %pos, "{text}");
    });

    let h = Arc::clone(host);
    engine.on_progress(move |_| h.stop.is_stopped().then_some(Dynamic::UNIT));

    // Numeric overloads shadow the math package's logarithm.
    let h = Arc::clone(host);
    engine.register_fn("log", move |value: Dynamic| h.sink.emit(to_value(&value)));
    let h = Arc::clone(host);
    engine.register_fn("log", move |value: f64| h.sink.emit(Value::Float(value)));
    let h = Arc::clone(host);
    engine.register_fn("log", move |value: i64| h.sink.emit(Value::Int(value)));
}

/// `evaluate(code)` runs in a scope of its own and only sees the caller's
/// functions; the engine's built-in `eval` shares the caller's variables.
fn register_nested(engine: &mut Engine, host: &Arc<ScriptHost>, compiler: Weak<Compiler>) {
    engine.register_type_with_name::<Script>("Script");
    engine.register_fn("run", |script: &mut Script| -> RhaiResult<Dynamic> { Ok(script.run()?) });
    engine.register_get("name", |script: &mut Script| script.name().to_string());

    let weak = compiler.clone();
    engine.register_fn("evaluate", move |code: ImmutableString| -> RhaiResult<Dynamic> {
        let script = upgrade(&weak)?
            .evaluate(&code, EVAL_UNIT, false)
            .map_err(ScriptError::from)?;
        Ok(script.run()?)
    });

    let h = Arc::clone(host);
    engine.register_fn("load", move |file: ImmutableString| -> RhaiResult<Script> {
        let path = h.resolve(&file);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| runtime_error(format!("cannot read {}: {e}", path.display())))?;
        let name = sources::unit_name(&h.working_dir, &path);
        Ok(upgrade(&compiler)?
            .evaluate(&text, &name, false)
            .map_err(ScriptError::from)?)
    });
}

fn register_system(engine: &mut Engine, host: &Arc<ScriptHost>) {
    let h = Arc::clone(host);
    engine.register_fn("exec", move |command: ImmutableString| -> RhaiResult<String> {
        Ok(h.exec(&command)?)
    });

    for name in ["sleep", "delay"] {
        let h = Arc::clone(host);
        engine.register_fn(name, move |ms: i64| -> RhaiResult<()> { Ok(h.sleep(ms)?) });
    }

    engine.register_fn("time", || -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    });
    let h = Arc::clone(host);
    engine.register_fn("nano_time", move || -> i64 {
        i64::try_from(h.started.elapsed().as_nanos()).unwrap_or(i64::MAX)
    });

    let h = Arc::clone(host);
    engine.register_fn("working_dir", move || h.working_dir.to_string_lossy().into_owned());
    let h = Arc::clone(host);
    engine.register_fn("owner", move || -> Dynamic {
        h.owner.clone().map_or(Dynamic::UNIT, Dynamic::from)
    });
    engine.register_fn("version", || env!("CARGO_PKG_VERSION").to_string());

    let h = Arc::clone(host);
    engine.register_fn("http_get", move |url: ImmutableString| {
        h.http(&url, |client| client.get(url.as_str()))
    });
    let h = Arc::clone(host);
    engine.register_fn("http_get", move |url: ImmutableString, params: Map| {
        let query = form_pairs(&params);
        h.http(&url, |client| client.get(url.as_str()).query(&query))
    });
    let h = Arc::clone(host);
    engine.register_fn("http_post", move |url: ImmutableString, params: Map| {
        let form = form_pairs(&params);
        h.http(&url, |client| client.post(url.as_str()).form(&form))
    });
}

/// Map entries as string pairs; non-string values use their display form.
fn form_pairs(params: &Map) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn register_files(engine: &mut Engine, host: &Arc<ScriptHost>) {
    let h = Arc::clone(host);
    engine.register_fn("read", move |file: ImmutableString| -> Dynamic {
        std::fs::read_to_string(h.resolve(&file)).map_or(Dynamic::UNIT, Dynamic::from)
    });

    let h = Arc::clone(host);
    engine.register_fn("write", move |file: ImmutableString, text: ImmutableString| -> bool {
        std::fs::write(h.resolve(&file), text.as_bytes()).is_ok()
    });

    let h = Arc::clone(host);
    engine.register_fn("append", move |file: ImmutableString, text: ImmutableString| -> bool {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(h.resolve(&file))
            .and_then(|mut f| f.write_all(text.as_bytes()))
            .is_ok()
    });

    let h = Arc::clone(host);
    engine.register_fn("delete_file", move |file: ImmutableString| -> bool {
        let path = h.resolve(&file);
        if path.is_dir() {
            std::fs::remove_dir_all(path).is_ok()
        } else {
            std::fs::remove_file(path).is_ok()
        }
    });

    let h = Arc::clone(host);
    engine.register_fn("mkdir", move |dir: ImmutableString| -> bool {
        std::fs::create_dir(h.resolve(&dir)).is_ok()
    });

    let h = Arc::clone(host);
    engine.register_fn("mkdirs", move |dir: ImmutableString| -> bool {
        std::fs::create_dir_all(h.resolve(&dir)).is_ok()
    });

    let h = Arc::clone(host);
    engine.register_fn("copy_file", move |from: ImmutableString, to: ImmutableString| -> bool {
        std::fs::copy(h.resolve(&from), h.resolve(&to)).is_ok()
    });

    let h = Arc::clone(host);
    engine.register_fn("move_file", move |from: ImmutableString, to: ImmutableString| -> bool {
        std::fs::rename(h.resolve(&from), h.resolve(&to)).is_ok()
    });
}

fn register_device(engine: &mut Engine, host: &Arc<ScriptHost>) {
    for name in ["tap", "click"] {
        let h = Arc::clone(host);
        engine.register_fn(name, move |x: i64, y: i64| -> RhaiResult<()> {
            h.capabilities.device.tap(x, y).map_err(runtime_error)
        });
    }

    let h = Arc::clone(host);
    engine.register_fn("swipe", move |x1: i64, y1: i64, x2: i64, y2: i64| -> RhaiResult<()> {
        let (from, to) = ((x1, y1), (x2, y2));
        h.capabilities
            .device
            .swipe(from, to, default_steps(from, to))
            .map_err(runtime_error)
    });
    let h = Arc::clone(host);
    engine.register_fn(
        "swipe",
        move |x1: i64, y1: i64, x2: i64, y2: i64, steps: i64| -> RhaiResult<()> {
            h.capabilities.device.swipe((x1, y1), (x2, y2), steps).map_err(runtime_error)
        },
    );

    let h = Arc::clone(host);
    engine.register_fn("drag", move |x1: i64, y1: i64, x2: i64, y2: i64| -> RhaiResult<()> {
        let (from, to) = ((x1, y1), (x2, y2));
        h.capabilities
            .device
            .drag(from, to, default_steps(from, to))
            .map_err(runtime_error)
    });
    let h = Arc::clone(host);
    engine.register_fn(
        "drag",
        move |x1: i64, y1: i64, x2: i64, y2: i64, steps: i64| -> RhaiResult<()> {
            h.capabilities.device.drag((x1, y1), (x2, y2), steps).map_err(runtime_error)
        },
    );

    for (name, action) in [
        ("touch_down", TouchAction::Down),
        ("touch_move", TouchAction::Move),
        ("touch_up", TouchAction::Up),
    ] {
        let h = Arc::clone(host);
        engine.register_fn(name, move |x: i64, y: i64| -> RhaiResult<()> {
            h.capabilities.device.touch(action, x, y).map_err(runtime_error)
        });
    }

    let h = Arc::clone(host);
    engine.register_fn("rotation", move || i64::from(h.capabilities.device.rotation()));
    let h = Arc::clone(host);
    engine.register_fn("display_width", move || i64::from(h.capabilities.device.display_size().0));
    let h = Arc::clone(host);
    engine.register_fn("display_height", move || i64::from(h.capabilities.device.display_size().1));
    let h = Arc::clone(host);
    engine.register_fn("active_window", move || {
        h.capabilities.device.active_window().unwrap_or_default()
    });

    let h = Arc::clone(host);
    engine.register_fn("screenshot", move |file: ImmutableString| h.screenshot(&file));

    let h = Arc::clone(host);
    engine.register_fn(
        "find_pic",
        move |file: ImmutableString, left: i64, top: i64, right: i64, bottom: i64, similarity: f64| {
            let region = Region { left, top, right, bottom };
            h.find_pic(&file, region, similarity)
        },
    );
}

fn register_services(engine: &mut Engine, host: &Arc<ScriptHost>) {
    let h = Arc::clone(host);
    engine.register_fn("toast", move |text: ImmutableString| -> RhaiResult<()> {
        h.app()?.toast(&text).map_err(runtime_error)
    });

    let h = Arc::clone(host);
    engine.register_fn("get_config", move |name: ImmutableString| -> RhaiResult<Dynamic> {
        let value = h.app()?.get_config(&name).map_err(runtime_error)?;
        Ok(value.map_or(Dynamic::UNIT, Dynamic::from))
    });

    let h = Arc::clone(host);
    engine.register_fn(
        "save_config",
        move |name: ImmutableString, value: ImmutableString| -> RhaiResult<()> {
            h.app()?.save_config(&name, &value).map_err(runtime_error)
        },
    );

    let h = Arc::clone(host);
    engine.register_fn("input_text", move |text: ImmutableString| -> RhaiResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        h.input()?.input(&text).map_err(runtime_error)
    });

    let h = Arc::clone(host);
    engine.register_fn("clear_text", move |before: i64, after: i64| -> RhaiResult<()> {
        h.input()?.clear(before, after).map_err(runtime_error)
    });

    let h = Arc::clone(host);
    engine.register_fn(
        "call_service",
        move |suffix: ImmutableString, method: ImmutableString, args: Array| -> RhaiResult<Dynamic> {
            let result = h
                .proxy(&suffix)?
                .call(&method, &array_to_values(&args))
                .map_err(runtime_error)?;
            Ok(to_dynamic(result))
        },
    );
}

#[cfg(test)]
mod tests {
    use crate::capability::{Capabilities, ImageMatcher, Region, ScreenCapture};
    use crate::config::CompilerConfig;
    use crate::rpc::server::bind_service;
    use crate::rpc::services::{app_service, input_service, AppService, InputService};
    use crate::rpc::{RpcError, Value};
    use crate::script::{run_request, Environment, LogSink, StopSignal};
    use crate::transport::{RunRequest, RunResult};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<Value>>);

    impl LogSink for MemorySink {
        fn emit(&self, value: Value) {
            self.0.lock().unwrap().push(value);
        }
    }

    struct FixedScreen;

    impl ScreenCapture for FixedScreen {
        fn capture(&self, _rotation: i32, width: u32, height: u32, _quality: u8) -> anyhow::Result<Vec<u8>> {
            Ok(format!("{width}x{height}").into_bytes())
        }
    }

    /// Matches when the template bytes equal the screen bytes.
    struct EqualMatcher;

    impl ImageMatcher for EqualMatcher {
        fn find(&self, screen: &[u8], template: &[u8], region: Region, _sim: f64) -> anyhow::Result<Option<(i64, i64)>> {
            Ok((screen == template).then_some((region.left, region.top)))
        }
    }

    fn capabilities() -> Capabilities {
        let mut caps = Capabilities::headless(720, 1280);
        caps.screen = Arc::new(FixedScreen);
        caps.matcher = Some(Arc::new(EqualMatcher));
        caps
    }

    fn env(socket_dir: &std::path::Path) -> Environment {
        Environment {
            capabilities: capabilities(),
            compiler: CompilerConfig::default(),
            socket_dir: socket_dir.to_path_buf(),
            rpc_timeout: Duration::from_secs(5),
            runtime: Handle::current(),
            stop: StopSignal::new(),
        }
    }

    async fn run(dir: &std::path::Path, owner: Option<&str>, source: &str) -> RunResult {
        let env = env(dir);
        let request = RunRequest {
            working_dir: dir.to_string_lossy().into_owned(),
            source_text: Some(source.to_string()),
            owner_id: owner.map(str::to_string),
        };
        tokio::task::spawn_blocking(move || {
            run_request(&env, &request, Arc::new(MemorySink::default()))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn file_helpers_work_relative_to_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = r#"
            mkdirs("a/b");
            write("a/b/f.txt", "hello");
            append("a/b/f.txt", " world");
            copy_file("a/b/f.txt", "g.txt");
            move_file("g.txt", "h.txt");
            let missing = read("g.txt");
            [read("h.txt"), type_of(missing) == "()", delete_file("a")]
        "#;
        let result = run(dir.path(), None, source).await;
        assert_eq!(result, RunResult::Value(json!(["hello world", true, true])));
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn nested_evaluate_and_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("extra.txt"), "fn triple(x) { x * 3 }\ntriple(5)").unwrap();
        let source = r#"
            let a = evaluate("6 * 7");
            let s = load("extra.txt");
            [a, s.run(), s.name]
        "#;
        let result = run(dir.path(), None, source).await;
        assert_eq!(result, RunResult::Value(json!([42, 15, "extra.txt"])));
    }

    #[tokio::test]
    async fn evaluate_is_isolated_but_eval_shares_variables() {
        let dir = tempfile::tempdir().unwrap();
        let source = r#"
            let x = 5;
            let isolated = false;
            try { evaluate("x"); } catch { isolated = true; }
            [eval("x + 1"), isolated]
        "#;
        let result = run(dir.path(), None, source).await;
        assert_eq!(result, RunResult::Value(json!([6, true])));
    }

    #[tokio::test]
    async fn nested_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(dir.path(), None, "evaluate(\"fn f(\")").await;
        match result {
            RunResult::Error(message) => assert!(message.contains("eval"), "{message}"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_and_display_functions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("needle.bin"), "720x1280").unwrap();
        let source = r#"
            tap(1, 2); click(3, 4);
            swipe(0, 0, 100, 100); swipe(0, 0, 100, 100, 5);
            drag(0, 0, 10, 10); touch_down(1, 1); touch_move(2, 2); touch_up(2, 2);
            let shot = screenshot("shot.bin");
            [display_width(), display_height(), rotation(), shot, find_pic("needle.bin", 5, 6, 100, 100, 0.9)]
        "#;
        let result = run(dir.path(), None, source).await;
        assert_eq!(
            result,
            RunResult::Value(json!([720, 1280, 0, true, {"x": 5, "y": 6}]))
        );
        assert_eq!(std::fs::read(dir.path().join("shot.bin")).unwrap(), b"720x1280");
    }

    #[tokio::test]
    async fn exec_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(dir.path(), None, "exec(\"echo hi\")").await;
        assert_eq!(result, RunResult::Value(json!("hi\n")));
    }

    #[tokio::test]
    async fn services_need_an_owner() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(dir.path(), None, "toast(\"x\")").await;
        assert!(matches!(result, RunResult::Error(m) if m.contains("no owner")));
    }

    #[derive(Default)]
    struct MemoryApp(Mutex<HashMap<String, String>>);

    impl AppService for MemoryApp {
        fn toast(&self, _text: &str) -> Result<(), RpcError> {
            Ok(())
        }

        fn get_config(&self, name: &str) -> Result<Option<String>, RpcError> {
            Ok(self.0.lock().unwrap().get(name).cloned())
        }

        fn save_config(&self, name: &str, value: &str) -> Result<(), RpcError> {
            self.0.lock().unwrap().insert(name.into(), value.into());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn owner_services_are_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let _app = bind_service(dir.path(), app_service("com.example", Arc::new(MemoryApp::default())))
            .await
            .unwrap();

        let source = r#"
            toast("hi");
            let before = get_config("k");
            save_config("k", "v");
            [type_of(before) == "()", get_config("k"), call_service("app", "get_config", ["k"])]
        "#;
        let result = run(dir.path(), Some("com.example"), source).await;
        assert_eq!(result, RunResult::Value(json!([true, "v", "v"])));
    }

    #[derive(Default)]
    struct RecordingInput(Mutex<Vec<String>>);

    impl InputService for RecordingInput {
        fn input(&self, text: &str) -> Result<(), RpcError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn clear(&self, _before: i64, _after: i64) -> Result<(), RpcError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_input_text_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let input = Arc::new(RecordingInput::default());
        let _service = bind_service(dir.path(), input_service("com.example", input.clone()))
            .await
            .unwrap();

        let result = run(dir.path(), Some("com.example"), "input_text(\"\"); input_text(\"abc\");").await;
        assert_eq!(result, RunResult::Value(serde_json::Value::Null));
        assert_eq!(*input.0.lock().unwrap(), vec!["abc".to_string()]);
    }

    /// Serves each connection one response: `<request line>|<body>`, or a
    /// 404 for paths containing `missing`.
    async fn echo_http_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let (head, body) = loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        received.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&received).into_owned();
                        if let Some((head, body)) = text.split_once("\r\n\r\n") {
                            let length = head
                                .lines()
                                .filter_map(|line| line.split_once(':'))
                                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                                .map_or(0, |(_, value)| value.trim().parse::<usize>().unwrap());
                            if body.len() >= length || n == 0 {
                                break (head.to_string(), body.to_string());
                            }
                        }
                        assert!(n > 0, "request ended early");
                    };
                    let request_line = head.lines().next().unwrap_or_default();
                    let status = if request_line.contains("missing") { "404 Not Found" } else { "200 OK" };
                    let reply = format!("{request_line}|{body}");
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    stream.write_all(response.as_bytes()).await.unwrap();
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_helpers_return_bodies_or_unit() {
        let dir = tempfile::tempdir().unwrap();
        let base = echo_http_server().await;
        let source = format!(
            r#"
            let base = "{base}";
            [
                http_get(base + "/a"),
                http_get(base + "/q", #{{k: "v w"}}),
                http_post(base + "/p", #{{name: "x"}}),
                type_of(http_get(base + "/missing"))
            ]
        "#
        );
        let result = run(dir.path(), None, &source).await;
        assert_eq!(
            result,
            RunResult::Value(json!([
                "GET /a HTTP/1.1|",
                "GET /q?k=v+w HTTP/1.1|",
                "POST /p HTTP/1.1|name=x",
                "()"
            ]))
        );
    }
}
