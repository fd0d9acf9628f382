use crate::{
    capture::CapturedRequest,
    replay::{ReplayClient, ReplayError, replay},
};

pub const INJECTION_PAYLOADS: [&str; 2] = ["'", "\""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Suspicious,
    Clean,
}

impl Verdict {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Suspicious => "Possible SQL Injection",
            Self::Clean => "No SQL Injections",
        }
    }
}

pub fn with_payload_in_path(record: &CapturedRequest, payload: &str) -> CapturedRequest {
    let mut mutated = record.clone();
    mutated.path.push_str(payload);
    mutated
}

pub fn with_payload_in_cookies(record: &CapturedRequest, payload: &str) -> CapturedRequest {
    let mut mutated = record.clone();
    for value in mutated.cookies.values_mut() {
        value.push_str(payload);
    }
    mutated
}

pub fn with_payload_in_headers(record: &CapturedRequest, payload: &str) -> CapturedRequest {
    let mut mutated = record.clone();
    for values in mutated.headers.values_mut() {
        if let Some(last) = values.last_mut() {
            last.push_str(payload);
        }
    }
    mutated
}

/// Replays quote-bearing variants of a captured request and compares status
/// codes against an unmodified baseline. Stops at the first divergence.
pub async fn scan(
    client: &ReplayClient,
    record: &CapturedRequest,
) -> Result<Verdict, ReplayError> {
    let baseline = replay(client, record).await?.status();

    for payload in INJECTION_PAYLOADS {
        let mutations = [
            with_payload_in_path(record, payload),
            with_payload_in_cookies(record, payload),
            with_payload_in_headers(record, payload),
        ];
        for mutated in &mutations {
            let status = replay(client, mutated).await?.status();
            if status != baseline {
                return Ok(Verdict::Suspicious);
            }
        }
    }

    Ok(Verdict::Clean)
}
