//! Local gpsd GPS reader
//!
//! Connects to a running `gpsd` (default `127.0.0.1:2947`), performs the
//! usual VERSION/WATCH/DEVICES handshake via `gpsd_proto`, then holds the
//! connection open and folds `TPV`/`SKY` reports into the latest
//! [`GpsFix`]. The socket work happens on a dedicated background thread,
//! as the spec allows blocking GPS reads off the IMU loop's critical path;
//! `read_fix` itself only ever takes a lock.

use crate::sensors::GpsSource;
use crate::types::GpsFix;
use gpsd_proto::{handshake, Mode, UnifiedResponse};
use parking_lot::Mutex;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct SharedState {
    fix: Option<GpsFix>,
    fresh: bool,
    last_hdop: f64,
    last_num_sats: u32,
}

pub struct LocalGpsReader {
    state: Arc<Mutex<SharedState>>,
}

impl LocalGpsReader {
    /// Spawns the background connection thread immediately; construction
    /// never blocks and never fails; a gpsd that is not yet up is simply
    /// retried until it is.
    pub fn new(host: String, port: u16) -> Self {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let worker_state = state.clone();
        thread::spawn(move || run_forever(host, port, worker_state));
        Self { state }
    }
}

impl GpsSource for LocalGpsReader {
    fn read_fix(&mut self) -> Option<GpsFix> {
        let mut guard = self.state.lock();
        if guard.fresh {
            guard.fresh = false;
            guard.fix.clone()
        } else {
            None
        }
    }
}

fn run_forever(host: String, port: u16, state: Arc<Mutex<SharedState>>) {
    loop {
        if let Err(err) = connect_and_stream(&host, port, &state) {
            tracing::warn!(%err, %host, port, "gpsd connection dropped, retrying");
        }
        thread::sleep(RECONNECT_DELAY);
    }
}

fn connect_and_stream(host: &str, port: u16, state: &Arc<Mutex<SharedState>>) -> io::Result<()> {
    let stream = TcpStream::connect((host, port))?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    handshake(&mut reader, &mut writer)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    tracing::info!(host, port, "gpsd handshake complete");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(()); // EOF: gpsd closed the connection, reconnect.
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<UnifiedResponse>(line) else {
            continue;
        };
        apply_report(msg, state);
    }
}

fn apply_report(msg: UnifiedResponse, state: &Arc<Mutex<SharedState>>) {
    match msg {
        UnifiedResponse::Sky(sky) => {
            let mut guard = state.lock();
            if let Some(hdop) = sky.hdop {
                guard.last_hdop = hdop as f64;
            }
            if let Some(sats) = &sky.satellites {
                guard.last_num_sats = sats.iter().filter(|s| s.used).count() as u32;
            }
        }
        UnifiedResponse::Tpv(tpv) => {
            let mut guard = state.lock();
            let valid = !matches!(tpv.mode, Mode::NoFix);
            let fix_quality = if valid { 1 } else { 0 };
            let fix = GpsFix::new(
                tpv.lat.unwrap_or(0.0),
                tpv.lon.unwrap_or(0.0),
                tpv.alt.map(|v| v as f64).unwrap_or(0.0),
                tpv.speed.map(|v| v as f64).unwrap_or(0.0),
                tpv.track.map(|v| v as f64).unwrap_or(0.0),
                tpv.time.clone(),
                valid,
                fix_quality,
                guard.last_num_sats,
                guard.last_hdop,
            );
            guard.fix = Some(fix);
            guard.fresh = true;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_fix_is_none_before_any_report() {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let mut reader = LocalGpsReader { state };
        assert!(reader.read_fix().is_none());
    }

    #[test]
    fn read_fix_is_consumed_once() {
        let state = Arc::new(Mutex::new(SharedState::default()));
        {
            let mut guard = state.lock();
            guard.fix = Some(GpsFix::new(1.0, 2.0, 0.0, 0.0, 0.0, None, true, 1, 4, 1.0));
            guard.fresh = true;
        }
        let mut reader = LocalGpsReader { state };
        assert!(reader.read_fix().is_some());
        assert!(reader.read_fix().is_none());
    }
}
