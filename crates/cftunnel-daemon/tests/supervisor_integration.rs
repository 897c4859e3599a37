//! Runs the supervisor against a shell script standing in for cloudflared.
#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cftunnel_daemon::auth_proxy::{AuthProxy, AuthProxyConfig, AuthProxyError, AuthProxyFactory};
use cftunnel_daemon::state::process_alive;
use cftunnel_daemon::{BinaryAcquirer, MirrorList, SuperviseError, Supervisor};

/// Install a fake cloudflared that records its args and pid, prints a
/// quick-tunnel banner to stderr, then runs `tail`.
fn install_fake(data_dir: &Path, tail: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = cftunnel_core::paths::cloudflared_path(data_dir);
    std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
    let script = format!(
        r#"#!/bin/sh
dir="$(dirname "$0")"
printf '%s\n' "$@" > "$dir/args.txt"
echo $$ > "$dir/pid.txt"
trap 'exit 0' TERM
echo "INF Requesting new quick Tunnel on trycloudflare.com..." >&2
echo "INF |  https://quiet-fox-lamp.trycloudflare.com  |" >&2
{tail}
"#
    );
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
    bin
}

const RUN_FOREVER: &str = "while true; do sleep 0.1; done";

fn supervisor(data_dir: &Path) -> Supervisor {
    let acquirer = BinaryAcquirer::new(data_dir).with_path_lookup(false);
    Supervisor::new(data_dir, acquirer)
}

fn recorded_args(bin: &Path) -> Option<Vec<String>> {
    let text = std::fs::read_to_string(bin.with_file_name("args.txt")).ok()?;
    Some(text.lines().map(str::to_string).collect())
}

async fn wait_for_file(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

struct FakeProxy {
    port: u16,
    fail: bool,
    stops: Arc<AtomicUsize>,
    started: bool,
}

/// Counters shared between a test and the proxies its factory builds.
#[derive(Default)]
struct ProxyLog {
    stops: Arc<AtomicUsize>,
    configs: Arc<Mutex<Vec<AuthProxyConfig>>>,
}

impl ProxyLog {
    fn factory(&self, port: u16, fail: bool) -> AuthProxyFactory {
        let stops = Arc::clone(&self.stops);
        let configs = Arc::clone(&self.configs);
        AuthProxyFactory::new(move |config| {
            configs.lock().unwrap().push(config);
            Box::new(FakeProxy {
                port,
                fail,
                stops: Arc::clone(&stops),
                started: false,
            })
        })
    }

    fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

fn route_auth(target_port: u16) -> AuthProxyConfig {
    AuthProxyConfig {
        username: "ops".into(),
        password: "hunter2".into(),
        target_port,
        signing_key: b"route-key".to_vec(),
        cookie_ttl: Duration::from_secs(3600),
    }
}

impl AuthProxy for FakeProxy {
    fn start(&mut self) -> Result<(), AuthProxyError> {
        if self.fail {
            return Err(AuthProxyError::Bind(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address in use",
            )));
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn listen_port(&self) -> Option<u16> {
        self.started.then_some(self.port)
    }
}

#[tokio::test]
async fn interrupt_stops_child_and_clears_marker() {
    let dir = tempfile::tempdir().unwrap();
    let bin = install_fake(dir.path(), RUN_FOREVER);
    let sup = supervisor(dir.path());
    let pid_file = bin.with_file_name("pid.txt");

    let shutdown = {
        let pid_file = pid_file.clone();
        async move {
            wait_for_file(&pid_file).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    tokio::time::timeout(
        Duration::from_secs(20),
        sup.start_foreground_until(3000, None, shutdown),
    )
    .await
    .expect("supervisor did not return")
    .unwrap();

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!process_alive(pid), "cloudflared still alive");
    assert!(!sup.tracker().marker_path().exists());
    assert!(!sup.tracker().is_running());
}

#[tokio::test]
async fn passes_isolated_config_and_local_url() {
    let dir = tempfile::tempdir().unwrap();
    let bin = install_fake(dir.path(), "exit 0");

    supervisor(dir.path())
        .start_foreground_until(8080, None, std::future::pending())
        .await
        .unwrap();

    let args = recorded_args(&bin).unwrap();
    let config = cftunnel_core::paths::quick_config_path(dir.path());
    assert_eq!(
        args,
        [
            "tunnel".to_string(),
            "--config".to_string(),
            config.display().to_string(),
            "--url".to_string(),
            "http://localhost:8080".to_string(),
        ]
    );
    assert!(config.exists());
}

#[tokio::test]
async fn nonzero_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    install_fake(dir.path(), "exit 3");
    let sup = supervisor(dir.path());

    let err = sup
        .start_foreground_until(3000, None, std::future::pending())
        .await
        .unwrap_err();

    match err {
        SuperviseError::AbnormalExit(status) => assert_eq!(status.code(), Some(3)),
        other => panic!("expected AbnormalExit, got {other:?}"),
    }
    assert!(!sup.tracker().marker_path().exists());
}

#[tokio::test]
async fn auth_proxy_fronts_the_tunnel_and_is_stopped_once() {
    let dir = tempfile::tempdir().unwrap();
    let bin = install_fake(dir.path(), "exit 0");
    let log = ProxyLog::default();

    supervisor(dir.path())
        .with_auth_proxy(log.factory(45_678, false))
        .start_foreground_until(3000, Some(route_auth(3000)), std::future::pending())
        .await
        .unwrap();

    let args = recorded_args(&bin).unwrap();
    assert_eq!(args.last().map(String::as_str), Some("http://localhost:45678"));
    assert_eq!(log.stop_count(), 1);
    assert_eq!(*log.configs.lock().unwrap(), [route_auth(3000)]);
}

#[tokio::test]
async fn auth_proxy_is_stopped_when_cloudflared_fails() {
    let dir = tempfile::tempdir().unwrap();
    install_fake(dir.path(), "exit 1");
    let log = ProxyLog::default();

    let err = supervisor(dir.path())
        .with_auth_proxy(log.factory(45_679, false))
        .start_foreground_until(3000, Some(route_auth(3000)), std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, SuperviseError::AbnormalExit(_)));
    assert_eq!(log.stop_count(), 1);
}

#[tokio::test]
async fn proxy_start_failure_prevents_launch() {
    let dir = tempfile::tempdir().unwrap();
    let bin = install_fake(dir.path(), "exit 0");
    let log = ProxyLog::default();
    let sup = supervisor(dir.path()).with_auth_proxy(log.factory(45_680, true));

    let err = sup
        .start_foreground_until(3000, Some(route_auth(3000)), std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, SuperviseError::AuthProxy(_)));
    assert!(recorded_args(&bin).is_none(), "cloudflared must not start");
    assert!(!sup.tracker().marker_path().exists());
}

#[tokio::test]
async fn second_start_during_download_is_refused() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes("#!/bin/sh\nexit 0\n")
                .set_delay(Duration::from_millis(800)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let acquirer = BinaryAcquirer::new(dir.path())
        .with_path_lookup(false)
        .with_target("linux", "x86_64")
        .with_sources(MirrorList::new(Vec::<String>::new()), format!("{}/", server.uri()));
    let first = Supervisor::new(dir.path(), acquirer.clone());
    let second = Supervisor::new(dir.path(), acquirer);
    let marker = first.tracker().marker_path().to_path_buf();

    let first_run = tokio::spawn(async move {
        first
            .start_foreground_until(3000, None, std::future::pending())
            .await
    });
    wait_for_file(&marker).await;

    match second
        .start_foreground_until(4000, None, std::future::pending())
        .await
    {
        Err(SuperviseError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    tokio::time::timeout(Duration::from_secs(20), first_run)
        .await
        .expect("first supervisor did not return")
        .unwrap()
        .unwrap();
    assert!(!marker.exists());
}
