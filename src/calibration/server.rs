//! Calibration control server
//!
//! A line-oriented JSON RPC server, loopback-bound by convention: one
//! request line in, one response line out, every connection independent
//! and serialized only at the `CalibrationManager`'s internal lock. No
//! input — malformed JSON, an empty object, an unrecognized key — is
//! allowed to do anything but produce an `{"error": ...}` line.

use crate::calibration::{CalibrationError, CalibrationManager, CalibrationPatch};
use crate::types::{coerce_f64, vec3_from_json, CalibrationStatus, Vec3};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub async fn serve(bind: &str, port: u16, manager: CalibrationManager) -> Result<()> {
    let listener = TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("binding calibration control listener on {bind}:{port}"))?;
    tracing::info!(bind, port, "calibration control server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, manager).await {
                tracing::debug!(%peer, %err, "calibration client disconnected");
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, manager: CalibrationManager) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let response = handle_request(&line, &manager);
        let mut encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"error":"internal encoding error"}"#.to_string());
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

fn handle_request(line: &str, manager: &CalibrationManager) -> Value {
    let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
        return json!({ "error": "request is not valid JSON" });
    };
    let Some(obj) = value.as_object() else {
        return json!({ "error": "request must be a JSON object" });
    };
    if obj.is_empty() {
        return json!({ "error": "empty request" });
    }

    if obj.contains_key("get_calibration") {
        let snapshot = manager.get();
        return json!({
            "gyro_bias": vec3_to_array(snapshot.calibration.gyro_bias),
            "accel_offset": vec3_to_array(snapshot.calibration.accel_offset),
            "magnetometer_bias": vec3_to_array(snapshot.calibration.magnetometer_bias),
            "calibration_status": status_str(snapshot.run.status),
            "samples_collected": snapshot.run.samples_collected,
            "samples_needed": snapshot.run.samples_needed,
        });
    }

    if let Some(patch_value) = obj.get("set_calibration") {
        return match build_patch(patch_value) {
            Ok(patch) => {
                manager.set(patch);
                json!({ "ok": true })
            }
            Err(err) => json!({ "error": err.to_string() }),
        };
    }

    if let Some(args) = obj.get("calibrate_gyro") {
        return match args.get("seconds").and_then(coerce_f64) {
            Some(seconds) => {
                let samples_needed = manager.start_gyro_run(seconds);
                json!({ "status": "collecting", "samples_needed": samples_needed })
            }
            None => json!({ "error": "calibrate_gyro requires a numeric \"seconds\"" }),
        };
    }

    json!({ "error": "unrecognized request" })
}

fn build_patch(value: &Value) -> Result<CalibrationPatch, CalibrationError> {
    let Some(obj) = value.as_object() else {
        return Err(CalibrationError::InvalidField("set_calibration".to_string()));
    };
    let mut patch = CalibrationPatch::default();
    for (key, val) in obj {
        let vec = vec3_from_json(val).ok_or_else(|| CalibrationError::InvalidField(key.clone()))?;
        match key.as_str() {
            "gyro_bias" => patch.gyro_bias = Some(vec),
            "accel_offset" => patch.accel_offset = Some(vec),
            "magnetometer_bias" => patch.magnetometer_bias = Some(vec),
            other => return Err(CalibrationError::UnknownField(other.to_string())),
        }
    }
    Ok(patch)
}

fn status_str(status: CalibrationStatus) -> &'static str {
    match status {
        CalibrationStatus::Idle => "idle",
        CalibrationStatus::Collecting => "collecting",
    }
}

fn vec3_to_array(v: Vec3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_calibration_reports_idle_by_default() {
        let manager = CalibrationManager::new(None, 100);
        let resp = handle_request(r#"{"get_calibration":true}"#, &manager);
        assert_eq!(resp["calibration_status"], "idle");
        assert_eq!(resp["gyro_bias"], json!([0.0, 0.0, 0.0]));
    }

    #[test]
    fn set_calibration_round_trips_through_get() {
        let manager = CalibrationManager::new(None, 100);
        let set_resp =
            handle_request(r#"{"set_calibration":{"gyro_bias":[0.1,0.2,0.3]}}"#, &manager);
        assert_eq!(set_resp["ok"], true);

        let get_resp = handle_request(r#"{"get_calibration":true}"#, &manager);
        assert_eq!(get_resp["gyro_bias"], json!([0.1, 0.2, 0.3]));
    }

    #[test]
    fn set_calibration_with_bad_element_errors_without_mutating() {
        let manager = CalibrationManager::new(None, 100);
        let resp =
            handle_request(r#"{"set_calibration":{"gyro_bias":[1,2,"x"]}}"#, &manager);
        assert!(resp.get("error").is_some());
        assert_eq!(manager.current_calibration().gyro_bias, Vec3::zeros());
    }

    #[test]
    fn calibrate_gyro_reports_samples_needed() {
        let manager = CalibrationManager::new(None, 100);
        let resp = handle_request(r#"{"calibrate_gyro":{"seconds":1}}"#, &manager);
        assert_eq!(resp["status"], "collecting");
        assert_eq!(resp["samples_needed"], 100);
    }

    #[test]
    fn calibrate_gyro_without_seconds_errors() {
        let manager = CalibrationManager::new(None, 100);
        let resp = handle_request(r#"{"calibrate_gyro":{}}"#, &manager);
        assert!(resp.get("error").is_some());
    }

    #[test]
    fn build_patch_rejects_unknown_field() {
        let err = build_patch(&json!({"unknown_key": [1.0, 2.0, 3.0]})).unwrap_err();
        assert_eq!(err, CalibrationError::UnknownField("unknown_key".to_string()));
    }

    #[test]
    fn malformed_and_edge_case_requests_never_panic() {
        let manager = CalibrationManager::new(None, 100);
        for line in ["", "not json", "0", "[]", "{}", r#"{"unknown_key":1}"#] {
            let resp = handle_request(line, &manager);
            assert!(resp.get("error").is_some());
        }
    }
}
