// Copyright (c) 2024, The Parapet Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Telemetry metrics used throughout Parapet.
//!
//! Currently exported metrics:
//! - `http_requests_total`: Requests dispatched through the handler chain.
//! - `http_responses_4xx_total` / `http_responses_5xx_total`: Error-class
//!   responses, whether handler-written or default-rendered.
//! - `http_mitm_likely_total` / `http_mitm_unlikely_total` /
//!   `http_mitm_unknown_total`: TLS interception verdicts per request.
//! - `tls_handshakes_total`: ClientHello records captured.
//! - `bytes_written_total`: Response body bytes written.
//! - `panics_recovered_total`: Handler panics converted into 500s.
//! - `active_connections`: Currently open connections.
//! - `memory_usage_bytes`: Resident memory usage of the process.

use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use std::sync::atomic::AtomicBool;

/// Whether metric updates are recorded at all; flipped by `--telemetry`.
pub static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(false);

/// Updates a metric only when telemetry is enabled.
#[macro_export]
macro_rules! telemetry {
    ($e:expr) => {
        if $crate::telemetry::TELEMETRY_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            $e;
        }
    };
}

lazy_static::lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounter =
        register_int_counter!("http_requests_total", "Requests dispatched").unwrap();
    pub static ref RESPONSES_4XX: IntCounter =
        register_int_counter!("http_responses_4xx_total", "4xx responses").unwrap();
    pub static ref RESPONSES_5XX: IntCounter =
        register_int_counter!("http_responses_5xx_total", "5xx responses").unwrap();
    pub static ref MITM_LIKELY: IntCounter =
        register_int_counter!("http_mitm_likely_total", "Requests classified as likely intercepted").unwrap();
    pub static ref MITM_UNLIKELY: IntCounter =
        register_int_counter!("http_mitm_unlikely_total", "Requests classified as unlikely intercepted").unwrap();
    pub static ref MITM_UNKNOWN: IntCounter =
        register_int_counter!("http_mitm_unknown_total", "Requests with no interception verdict").unwrap();
    pub static ref TLS_HANDSHAKES: IntCounter =
        register_int_counter!("tls_handshakes_total", "ClientHello records captured").unwrap();
    pub static ref BYTES_WRITTEN: IntCounter =
        register_int_counter!("bytes_written_total", "Response body bytes written").unwrap();
    pub static ref PANICS_RECOVERED: IntCounter =
        register_int_counter!("panics_recovered_total", "Handler panics converted into 500s").unwrap();
    pub static ref ACTIVE_CONNECTIONS: IntGauge =
        register_int_gauge!("active_connections", "Currently open connections").unwrap();
    pub static ref MEMORY_USAGE_BYTES: IntGauge =
        register_int_gauge!("memory_usage_bytes", "Resident memory usage of the process").unwrap();
}

pub fn update_memory_usage() {
    let mut sys = sysinfo::System::new();
    if let Ok(pid) = sysinfo::get_current_pid() {
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        if let Some(proc) = sys.process(pid) {
            MEMORY_USAGE_BYTES.set(proc.memory() as i64);
        }
    }
}

/// Serves the registry in text form on a bare TCP listener.
pub fn serve(addr: &str) {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind metrics listener on {}: {}", addr, e);
            return;
        }
    };
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming().flatten() {
            let mut stream = stream;
            update_memory_usage();
            let metrics = prometheus::gather();
            let mut buf = Vec::new();
            if encoder.encode(&metrics, &mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
        }
    });
}

/// Logs the current registry contents, used at shutdown.
pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}
