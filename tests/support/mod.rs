//! In-process IntesisBox emulator speaking WMP on a local port

#![allow(dead_code)]

use intesisbox_wmp::{ClientConfig, DeviceEvent, EventReceiver, WmpError};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const RW_FUNCTIONS: [&str; 6] = ["ONOFF", "MODE", "SETPTEMP", "FANSP", "VANEUD", "VANELR"];

/// How the emulated gateway misbehaves
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Answer `ERR` to `ID`
    pub reject_login: bool,
    /// Answer `ERR` to every `LIMITS` query
    pub no_limits: bool,
    /// Answer this function's `LIMITS` query with an empty line
    pub silent_limits: Option<&'static str>,
    /// Answer single-function `GET`s of this function with this raw value
    pub garbled_get: Option<(&'static str, &'static str)>,
    /// Answer `ERR` to `GET,<unit>:*`
    pub reject_get_all: bool,
    /// Never answer single-function `GET`s
    pub ignore_get: bool,
    /// Answer `ERR` to any `SET` of this function
    pub reject_set: Option<&'static str>,
}

#[derive(Debug, Clone)]
enum Control {
    Push(String),
    Drop,
}

pub struct Emulator {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    device: Arc<Mutex<BTreeMap<String, String>>>,
    connections: Arc<AtomicUsize>,
    control: broadcast::Sender<Control>,
}

impl Emulator {
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    pub async fn with_behavior(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device: BTreeMap<String, String> = [
            ("MODE", "AUTO"),
            ("SETPTEMP", "210"),
            ("ONOFF", "ON"),
            ("FANSP", "AUTO"),
            ("AMBTEMP", "180"),
            ("VANEUD", "AUTO"),
            ("VANELR", "AUTO"),
            ("ERRSTATUS", "OK"),
            ("ERRCODE", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let emulator = Self {
            addr,
            received: Arc::new(Mutex::new(Vec::new())),
            device: Arc::new(Mutex::new(device)),
            connections: Arc::new(AtomicUsize::new(0)),
            control: broadcast::channel(16).0,
        };

        let received = emulator.received.clone();
        let device = emulator.device.clone();
        let connections = emulator.connections.clone();
        let control = emulator.control.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    socket,
                    behavior.clone(),
                    received.clone(),
                    device.clone(),
                    control.subscribe(),
                ));
            }
        });

        emulator
    }

    /// Client configuration pointing at this emulator, with short timers
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1")
            .with_port(self.addr.port())
            .with_connect_timeout(Duration::from_secs(2))
            .with_handshake_timeout(Duration::from_millis(500))
            .with_request_timeout(Duration::from_secs(1))
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_secs(1))
    }

    /// Every line received so far, across connections
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.received().iter().filter(|l| *l == line).count()
    }

    pub fn device_value(&self, function: &str) -> Option<String> {
        self.device.lock().unwrap().get(function).cloned()
    }

    pub fn set_device_value(&self, function: &str, value: &str) {
        self.device
            .lock()
            .unwrap()
            .insert(function.to_string(), value.to_string());
    }

    /// Send a raw line to every open connection
    pub fn push(&self, line: &str) {
        let _ = self.control.send(Control::Push(line.to_string()));
    }

    /// Close every open connection from the gateway side
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(
    socket: TcpStream,
    behavior: Behavior,
    received: Arc<Mutex<Vec<String>>>,
    device: Arc<Mutex<BTreeMap<String, String>>>,
    mut control: broadcast::Receiver<Control>,
) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        tokio::select! {
            read = reader.read_until(b'\r', &mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() {
                    continue;
                }
                received.lock().unwrap().push(line.clone());

                let response = respond(&line, &behavior, &device);
                for reply in response {
                    if writer.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            ctrl = control.recv() => match ctrl {
                Ok(Control::Push(line)) => {
                    if writer.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Drop) | Err(_) => return,
            }
        }
    }
}

fn respond(
    line: &str,
    behavior: &Behavior,
    device: &Arc<Mutex<BTreeMap<String, String>>>,
) -> Vec<String> {
    let mut device = device.lock().unwrap();

    if line == "ID" {
        if behavior.reject_login {
            return vec!["ERR".into()];
        }
        return vec!["ID:IS-IR-WMP-1,001DC9A2C911,127.0.0.1,ASCII,v1.0.7,-44".into()];
    }
    if line == "PING" {
        return vec!["PONG:-45".into()];
    }

    if let Some(function) = line.strip_prefix("LIMITS:") {
        if behavior.no_limits {
            return vec!["ERR".into()];
        }
        if behavior.silent_limits == Some(function) {
            return vec![String::new()];
        }
        let limits = match function {
            "ONOFF" => "[OFF,ON]",
            "MODE" => "[AUTO,HEAT,DRY,COOL,FAN]",
            "SETPTEMP" => "[160,300]",
            "FANSP" => "[AUTO,1,2,3,4]",
            "VANEUD" | "VANELR" => "[AUTO,1,2,3,SWING]",
            _ => return vec!["ERR".into()],
        };
        return vec![format!("LIMITS:{},{}", function, limits)];
    }

    if let Some(target) = line.strip_prefix("GET,") {
        let Some((unit, function)) = target.split_once(':') else {
            return vec!["ERR".into()];
        };
        if unit != "1" {
            return vec!["ERR".into()];
        }
        if function == "*" {
            if behavior.reject_get_all {
                return vec!["ERR".into()];
            }
            return device
                .iter()
                .map(|(k, v)| format!("CHN,1:{},{}", k, v))
                .collect();
        }
        if behavior.ignore_get {
            return vec![];
        }
        if let Some((garbled, raw)) = behavior.garbled_get {
            if garbled == function {
                return vec![format!("CHN,1:{},{}", function, raw)];
            }
        }
        return match device.get(function) {
            Some(value) => vec![format!("CHN,1:{},{}", function, value)],
            None => vec!["ERR".into()],
        };
    }

    if let Some(rest) = line.strip_prefix("SET,") {
        let Some((target, value)) = rest.split_once(',') else {
            return vec!["ERR".into()];
        };
        let Some(("1", function)) = target.split_once(':') else {
            return vec!["ERR".into()];
        };
        if !RW_FUNCTIONS.contains(&function) || behavior.reject_set == Some(function) {
            return vec!["ERR".into()];
        }
        let changed = device.get(function).map(String::as_str) != Some(value);
        device.insert(function.to_string(), value.to_string());
        if changed {
            return vec!["ACK".into(), format!("CHN,1:{},{}", function, value)];
        }
        return vec!["ACK".into()];
    }

    vec!["ERR".into()]
}

/// Wait for the next event matching `pred`, skipping everything else
pub async fn next_event<F>(events: &mut EventReceiver, pred: F) -> DeviceEvent
where
    F: Fn(&DeviceEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(WmpError::Lagged(_)) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `cond` until it holds or five seconds pass
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
