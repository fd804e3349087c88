/// Job/template data model shared by both mining dialects.
///
/// A `Job` is the proxy's internal view of a node block template: opaque
/// payload fields plus a derived `job_id` used to gate stale shares.
use hex::FromHexError;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    Progpow,
    RandomX,
}

impl Algo {
    pub fn tag(self) -> &'static str {
        match self {
            Algo::Progpow => "progpow",
            Algo::RandomX => "randomx",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgpowJob {
    pub job_id: String,
    pub pprpcheader: String,
    pub target: String,
    pub height: u64,
    pub bits: String,
    pub longpollid: String,
    pub pprpcepoch: String,
    pub pprpcnextepoch: String,
    pub pprpcnextepochheight: u64,
}

#[derive(Debug, Clone)]
pub struct RandomXJob {
    pub job_id: String,
    pub rxrpcheader: String,
    pub rxrpcseed: String,
    pub target: String,
    pub height: u64,
    pub longpollid: String,
}

#[derive(Debug, Clone)]
pub enum Job {
    Progpow(ProgpowJob),
    RandomX(RandomXJob),
}

impl Job {
    pub fn job_id(&self) -> &str {
        match self {
            Job::Progpow(j) => &j.job_id,
            Job::RandomX(j) => &j.job_id,
        }
    }

    pub fn longpollid(&self) -> &str {
        match self {
            Job::Progpow(j) => &j.longpollid,
            Job::RandomX(j) => &j.longpollid,
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            Job::Progpow(j) => j.height,
            Job::RandomX(j) => j.height,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Job::Progpow(j) => &j.target,
            Job::RandomX(j) => &j.target,
        }
    }
}

/// Distinguishes a fatal backend misconfiguration (process exit, §3/§6) from
/// a merely malformed template (log and retry on the next poll).
#[derive(Debug)]
pub enum TemplateError {
    Fatal(String),
    Invalid(String),
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Fatal(m) => write!(f, "{m}"),
            TemplateError::Invalid(m) => write!(f, "{m}"),
        }
    }
}

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(|v| v.as_str())
}

fn u64_field(raw: &Value, key: &str) -> Option<u64> {
    raw.get(key).and_then(|v| v.as_u64())
}

/// Parse a ProgPoW `getblocktemplate` result into a [`ProgpowJob`].
///
/// `job_id` is `pprpcheader` verbatim. Missing `pprpcheader` entirely, or a
/// present `pprpcheader` without `pprpcnextepoch`, indicates an
/// incompatible/misconfigured node and is fatal.
pub fn parse_progpow_template(raw: &Value) -> Result<ProgpowJob, TemplateError> {
    let header = match str_field(raw, "pprpcheader") {
        Some(h) => h,
        None => {
            return Err(TemplateError::Fatal(
                "node is either misconfigured or not up-to-date: no mining address set?"
                    .to_string(),
            ))
        }
    };
    if str_field(raw, "pprpcnextepoch").is_none() {
        return Err(TemplateError::Fatal(
            "node is too old: upgrade to a version that reports pprpcnextepoch".to_string(),
        ));
    }

    let target = str_field(raw, "target")
        .ok_or_else(|| TemplateError::Invalid("progpow template missing target".to_string()))?;
    let longpollid = str_field(raw, "longpollid")
        .ok_or_else(|| TemplateError::Invalid("progpow template missing longpollid".to_string()))?;
    let bits = str_field(raw, "bits")
        .ok_or_else(|| TemplateError::Invalid("progpow template missing bits".to_string()))?;
    let pprpcepoch = str_field(raw, "pprpcepoch")
        .ok_or_else(|| TemplateError::Invalid("progpow template missing pprpcepoch".to_string()))?;
    let pprpcnextepoch = str_field(raw, "pprpcnextepoch").unwrap();
    let height = u64_field(raw, "height")
        .ok_or_else(|| TemplateError::Invalid("progpow template missing height".to_string()))?;
    let pprpcnextepochheight = u64_field(raw, "pprpcnextepochheight").ok_or_else(|| {
        TemplateError::Invalid("progpow template missing pprpcnextepochheight".to_string())
    })?;

    Ok(ProgpowJob {
        job_id: header.to_string(),
        pprpcheader: header.to_string(),
        target: target.to_string(),
        height,
        bits: bits.to_string(),
        longpollid: longpollid.to_string(),
        pprpcepoch: pprpcepoch.to_string(),
        pprpcnextepoch: pprpcnextepoch.to_string(),
        pprpcnextepochheight,
    })
}

/// Parse a RandomX `getblocktemplate` result into a [`RandomXJob`].
///
/// `job_id` is `SHA-256(ASCII(rxrpcheader))` rendered as lowercase hex.
pub fn parse_randomx_template(raw: &Value) -> Result<RandomXJob, TemplateError> {
    let header = str_field(raw, "rxrpcheader")
        .ok_or_else(|| TemplateError::Invalid("randomx template missing rxrpcheader".to_string()))?;
    let seed = str_field(raw, "rxrpcseed")
        .ok_or_else(|| TemplateError::Invalid("randomx template missing rxrpcseed".to_string()))?;
    let target = str_field(raw, "target")
        .ok_or_else(|| TemplateError::Invalid("randomx template missing target".to_string()))?;
    let longpollid = str_field(raw, "longpollid")
        .ok_or_else(|| TemplateError::Invalid("randomx template missing longpollid".to_string()))?;
    let height = u64_field(raw, "height")
        .ok_or_else(|| TemplateError::Invalid("randomx template missing height".to_string()))?;

    Ok(RandomXJob {
        job_id: sha256_hex(header.as_bytes()),
        rxrpcheader: header.to_string(),
        rxrpcseed: seed.to_string(),
        target: target.to_string(),
        height,
        longpollid: longpollid.to_string(),
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Strips a leading `0x` prefix, if present.
pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Reverses the byte order of a hex string (hex -> bytes -> reverse -> hex).
pub fn reverse_endianness(hex_str: &str) -> Result<String, FromHexError> {
    let mut bytes = hex::decode(hex_str)?;
    bytes.reverse();
    Ok(hex::encode(bytes))
}

/// Approximate difficulty from a target's leading 8 bytes, formatted with a
/// magnitude suffix (T/G/M/K), mirroring the source's `formatDiff`.
pub fn format_diff(target: &str) -> Option<String> {
    let prefix = target.get(..16)?;
    let value = u64::from_str_radix(prefix, 16).ok()?;
    if value == 0 {
        return None;
    }
    let diff = u64::MAX as f64 / value as f64;
    const UNITS: [(f64, &str); 4] = [
        (1_000_000_000_000.0, "T"),
        (1_000_000_000.0, "G"),
        (1_000_000.0, "M"),
        (1_000.0, "K"),
    ];
    for (scale, suffix) in UNITS {
        if diff > scale {
            return Some(format!("{:.2}{}", diff / scale, suffix));
        }
    }
    Some(format!("{diff:.2}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progpow_job_id_is_header() {
        let raw = json!({
            "pprpcheader": "aa".repeat(32),
            "pprpcnextepoch": "11",
            "target": "00ff",
            "longpollid": "L0",
            "bits": "1d00ffff",
            "pprpcepoch": "ep0",
            "height": 1000,
            "pprpcnextepochheight": 1024,
        });
        let job = parse_progpow_template(&raw).unwrap();
        assert_eq!(job.job_id, job.pprpcheader);
        assert_eq!(job.height, 1000);
    }

    #[test]
    fn progpow_missing_header_is_fatal() {
        let raw = json!({ "pprpcnextepoch": "11" });
        match parse_progpow_template(&raw) {
            Err(TemplateError::Fatal(_)) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn progpow_header_without_next_epoch_is_fatal() {
        let raw = json!({ "pprpcheader": "aa" });
        match parse_progpow_template(&raw) {
            Err(TemplateError::Fatal(_)) => {}
            other => panic!("expected Fatal, got {other:?}"),
        }
    }

    #[test]
    fn randomx_job_id_is_sha256_of_header() {
        let header = "bb".repeat(146);
        let raw = json!({
            "rxrpcheader": header,
            "rxrpcseed": "aabb",
            "target": "0011223344556677".to_string() + &"00".repeat(24),
            "longpollid": "R0",
            "height": 42,
        });
        let job = parse_randomx_template(&raw).unwrap();
        assert_eq!(job.job_id, sha256_hex(header.as_bytes()));
    }

    #[test]
    fn reverse_endianness_round_trips() {
        let h = "aabbccddeeff0011";
        let once = reverse_endianness(h).unwrap();
        assert_ne!(once, h);
        let twice = reverse_endianness(&once).unwrap();
        assert_eq!(twice, h);
    }

    #[test]
    fn reverse_endianness_example() {
        assert_eq!(reverse_endianness("aabb").unwrap(), "bbaa");
    }

    #[test]
    fn strip_0x_removes_prefix_only_when_present() {
        assert_eq!(strip_0x("0xdead"), "dead");
        assert_eq!(strip_0x("dead"), "dead");
    }
}
