//! Log assembler - turns a request into a LogRecord
//!
//! Extraction is mechanical and total: every failure mode degrades to a
//! null field or an `{error, message}` stub, never to a dropped record.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AssemblyError;
use crate::record::{generate_log_id, LogRecord};
use crate::request::RequestContext;
use crate::util::{crc32_decimal, iso8601, truncate_chars};

static MOBILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)mobile|android|iphone|ipod|blackberry|windows phone|opera mini").unwrap()
});
static TABLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tablet|ipad|playbook|silk|kindle").unwrap());

/// Classify a user agent as mobile, tablet, or desktop. Mobile patterns win
/// over tablet patterns; anything else is desktop. No user agent, no class.
fn classify_device(user_agent: Option<&str>) -> Option<&'static str> {
    let ua = user_agent?;
    if MOBILE_RE.is_match(ua) {
        Some("mobile")
    } else if TABLET_RE.is_match(ua) {
        Some("tablet")
    } else {
        Some("desktop")
    }
}

/// Composite geographic id: continent, country, region code, city, postal
/// code joined with `-`, skipping missing components. All-missing → None.
fn geo_id(parts: &[Option<&str>]) -> Option<String> {
    let joined: Vec<&str> = parts
        .iter()
        .filter_map(|p| *p)
        .filter(|p| !p.is_empty())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("-"))
    }
}

/// Builds log records. Created once per process; the environment snapshot is
/// sanitized and serialized a single time up front.
pub struct Assembler {
    max_body_size: usize,
    environment: Option<String>,
}

impl Assembler {
    pub fn new(
        max_body_size: usize,
        environment: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        // Only scalar entries survive into the snapshot; nested structure
        // and nulls are dropped.
        let scalars: serde_json::Map<String, serde_json::Value> = environment
            .iter()
            .filter(|(_, v)| v.is_string() || v.is_number() || v.is_boolean())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let environment = if scalars.is_empty() {
            None
        } else {
            serde_json::to_string(&scalars).ok()
        };

        Self {
            max_body_size,
            environment,
        }
    }

    /// Assemble the full record for one request. `started` is the worker
    /// start time captured at entry.
    pub fn assemble(
        &self,
        ctx: &RequestContext<'_>,
        data: Option<&serde_json::Value>,
        started: DateTime<Utc>,
    ) -> LogRecord {
        let request = ctx.request();
        let cf = &request.cf;
        let mut record = LogRecord::new();

        // Identifiers
        record.set("logId", generate_log_id(started));
        record.set("rayId", ctx.header("cf-ray"));
        record.set("fpID", ctx.cookie("fpID"));

        // Fingerprints. Missing inputs hash as empty strings so every
        // request gets a stable triple.
        let ja3 = cf
            .bot_management
            .as_ref()
            .and_then(|bm| bm.ja3_hash.as_deref())
            .unwrap_or("");
        let tls_cipher = cf.tls_cipher.as_deref().unwrap_or("");
        let tls_client_random = cf.tls_client_random.as_deref().unwrap_or("");
        let user_agent = ctx.header("user-agent");
        let ua = user_agent.unwrap_or("");
        let client_ip = ctx.header("cf-connecting-ip").unwrap_or("");

        let tls_hash = crc32_decimal(&[ja3, tls_cipher, tls_client_random]);
        let device_hash = crc32_decimal(&[ua, ja3, tls_cipher]);
        let connection_hash = crc32_decimal(&[client_ip, ua, ja3, tls_cipher]);

        let (sample10, sample100) = sample_buckets(&connection_hash);
        record.set("tlsHash", tls_hash);
        record.set("deviceHash", device_hash);
        record.set("connectionHash", connection_hash);
        record.set("sample10", sample10);
        record.set("sample100", sample100);

        // Timing
        record.set("requestTime", started.timestamp_millis());
        record.set("receivedAt", iso8601(started));

        // Request line and URL parts
        record.set("url", request.url.as_str());
        if let Some(url) = ctx.url() {
            record.set("urlHost", url.host_str());
            record.set("urlPathname", url.path());
            record.set("urlSearch", url.query().map(|q| format!("?{q}")));
        } else {
            record.set("urlHost", None::<String>);
            record.set("urlPathname", None::<String>);
            record.set("urlSearch", None::<String>);
        }
        record.set("method", request.method.as_str());
        record.set(
            "headers",
            serde_json::to_string(&request.headers.to_json()).ok(),
        );
        record.set("mime", ctx.header("content-type"));
        record.set("userAgent", user_agent);
        record.set("referer", ctx.header("referer"));

        self.extract_body(ctx, &mut record);

        // Cookies
        record.set("cId", ctx.cookie("cId"));
        record.set("sId", ctx.cookie("sId"));
        record.set("eId", ctx.cookie("eId"));
        record.set("uID", ctx.cookie("uID"));
        record.set("emID", ctx.cookie("emID"));
        record.set("emA", ctx.cookie("emA"));

        // Edge annotations
        record.set("asn", cf.asn);
        record.set("colo", cf.colo.as_deref());
        record.set("continent", cf.continent.as_deref());
        record.set("country", cf.country.as_deref());
        record.set("region", cf.region.as_deref());
        record.set("regionCode", cf.region_code.as_deref());
        record.set("city", cf.city.as_deref());
        record.set("postalCode", cf.postal_code.as_deref());
        record.set("latitude", cf.latitude.as_deref());
        record.set("longitude", cf.longitude.as_deref());
        record.set("timezone", cf.timezone.as_deref());
        record.set("httpProtocol", cf.http_protocol.as_deref());
        record.set("tlsCipher", cf.tls_cipher.as_deref());
        record.set("tlsVersion", cf.tls_version.as_deref());
        record.set("tlsClientRandom", cf.tls_client_random.as_deref());
        record.set(
            "tlsClientAuth",
            cf.tls_client_auth
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok()),
        );
        record.set("ja3", if ja3.is_empty() { None } else { Some(ja3) });
        record.set("threatScore", cf.threat_score);
        record.set("clientTcpRtt", cf.client_tcp_rtt);

        let bm = cf.bot_management.as_ref();
        record.set("verifiedBot", bm.and_then(|b| b.verified_bot));
        record.set("botScore", bm.and_then(|b| b.score));
        record.set("corporateProxy", bm.and_then(|b| b.corporate_proxy));

        // Derived
        record.set("deviceType", classify_device(user_agent));
        record.set(
            "geoId",
            geo_id(&[
                cf.continent.as_deref(),
                cf.country.as_deref(),
                cf.region_code.as_deref(),
                cf.city.as_deref(),
                cf.postal_code.as_deref(),
            ]),
        );

        // Snapshots
        record.set("environment", self.environment.as_deref());
        record.set("data", serialize_caller_data(data));

        // Processing timing comes last so it covers the assembly itself
        let now = Utc::now();
        record.set("processedAt", iso8601(now));
        record.set(
            "processingDurationMs",
            (now - started).num_milliseconds().max(0),
        );

        record
    }

    /// Body capture: only methods that may carry one, only when one is
    /// present. Reads a borrowed copy; the caller's body is untouched.
    fn extract_body(&self, ctx: &RequestContext<'_>, record: &mut LogRecord) {
        let request = ctx.request();
        let method = request.method.to_ascii_uppercase();
        let body = match &request.body {
            Some(body) if method != "GET" && method != "HEAD" && !body.is_empty() => body,
            _ => {
                record.set("body", None::<String>);
                record.set("bodyTruncated", false);
                record.set("bodySize", None::<String>);
                return;
            }
        };

        let text = String::from_utf8_lossy(body);
        let truncated = text.chars().count() > self.max_body_size;
        record.set("body", truncate_chars(&text, self.max_body_size));
        record.set("bodyTruncated", truncated);
        record.set("bodySize", body.len() as i64);
    }
}

/// Deterministic sampling buckets from the decimal rendering of
/// `crc32(connectionHash)`: the last digit and the last two digits.
fn sample_buckets(connection_hash: &str) -> (i64, i64) {
    let bucket = crc32_decimal(&[connection_hash]);
    let bucket: u32 = bucket.parse().unwrap_or(0);
    ((bucket % 10) as i64, (bucket % 100) as i64)
}

/// Serialize caller data; on failure store the `{error, message}` stub so
/// the record still ships.
fn serialize_caller_data(data: Option<&serde_json::Value>) -> Option<String> {
    let data = data?;
    match serde_json::to_string(data) {
        Ok(json) => Some(json),
        Err(e) => {
            let err = AssemblyError::DataSerialization(e);
            tracing::warn!(error = %err, "recording stub in place of caller data");
            Some(
                serde_json::json!({
                    "error": "AssemblyError",
                    "message": err.to_string(),
                })
                .to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;
    use crate::request::{BotManagement, EdgeData, LogRequest};
    use serde_json::json;

    fn assembler() -> Assembler {
        Assembler::new(1000, &serde_json::Map::new())
    }

    fn assemble(request: &LogRequest) -> LogRecord {
        let ctx = RequestContext::new(request);
        assembler().assemble(&ctx, None, Utc::now())
    }

    #[test]
    fn test_sample_buckets_are_deterministic() {
        // crc32("37") = 1543800637 → last digit 7, last two digits 37
        assert_eq!(sample_buckets("37"), (7, 37));
        // And stable
        assert_eq!(sample_buckets("37"), sample_buckets("37"));
    }

    #[test]
    fn test_sample_buckets_in_range() {
        for input in ["", "a", "10.0.0.1Mozilla", "zzz", "1543800637"] {
            let (s10, s100) = sample_buckets(input);
            assert!((0..=9).contains(&s10), "{input}: sample10 {s10}");
            assert!((0..=99).contains(&s100), "{input}: sample100 {s100}");
            assert_eq!(s100 % 10, s10);
        }
    }

    #[test]
    fn test_hashes_with_all_inputs_missing() {
        let record = assemble(&LogRequest::new("GET", "https://example.com/"));
        // crc32 of all-empty input is 0
        assert_eq!(record.get_str("tlsHash"), Some("0"));
        assert_eq!(record.get_str("deviceHash"), Some("0"));
        assert_eq!(record.get_str("connectionHash"), Some("0"));
    }

    #[test]
    fn test_connection_hash_uses_ip_ua_ja3_cipher() {
        let request = LogRequest::new("GET", "https://example.com/")
            .with_header("cf-connecting-ip", "10.1.2.3")
            .with_header("User-Agent", "curl/8.0")
            .with_cf(EdgeData {
                tls_cipher: Some("AEAD-AES128-GCM-SHA256".to_string()),
                bot_management: Some(BotManagement {
                    ja3_hash: Some("abc123".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        let record = assemble(&request);
        let expected = crc32_decimal(&["10.1.2.3", "curl/8.0", "abc123", "AEAD-AES128-GCM-SHA256"]);
        assert_eq!(record.get_str("connectionHash"), Some(expected.as_str()));
    }

    #[test]
    fn test_device_classification() {
        assert_eq!(classify_device(None), None);
        assert_eq!(
            classify_device(Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)")),
            Some("mobile")
        );
        assert_eq!(
            classify_device(Some("Mozilla/5.0 (iPad; CPU OS 17_0)")),
            Some("tablet")
        );
        // Android tablets report both; mobile wins by precedence
        assert_eq!(
            classify_device(Some("Mozilla/5.0 (Linux; Android 14; Mobile; Tablet)")),
            Some("mobile")
        );
        assert_eq!(
            classify_device(Some("Mozilla/5.0 (X11; Linux x86_64)")),
            Some("desktop")
        );
    }

    #[test]
    fn test_geo_id_skips_missing_parts() {
        assert_eq!(
            geo_id(&[Some("EU"), Some("NL"), None, Some("Amsterdam"), Some("")]),
            Some("EU-NL-Amsterdam".to_string())
        );
        assert_eq!(geo_id(&[None, None, None, None, None]), None);
    }

    #[test]
    fn test_body_skipped_for_get() {
        let request =
            LogRequest::new("GET", "https://example.com/").with_body("ignored payload");
        let record = assemble(&request);
        assert_eq!(*record.get("body"), FieldValue::Null);
        assert_eq!(*record.get("bodyTruncated"), FieldValue::Bool(false));
    }

    #[test]
    fn test_body_captured_and_truncated() {
        let assembler = Assembler::new(5, &serde_json::Map::new());
        let request = LogRequest::new("POST", "https://example.com/").with_body("0123456789");
        let ctx = RequestContext::new(&request);
        let record = assembler.assemble(&ctx, None, Utc::now());
        assert_eq!(record.get_str("body"), Some("01234"));
        assert_eq!(*record.get("bodyTruncated"), FieldValue::Bool(true));
        assert_eq!(record.get_int("bodySize"), Some(10));
        // The request still owns its body
        assert_eq!(request.body.as_deref(), Some(b"0123456789".as_ref()));
    }

    #[test]
    fn test_environment_keeps_only_scalars() {
        let env: serde_json::Map<String, serde_json::Value> = serde_json::from_value(json!({
            "REGION": "eu-west",
            "MAX_BATCH_SIZE": 200,
            "DEBUG": false,
            "SECRET_BINDING": {"nested": true},
            "EMPTY": null
        }))
        .unwrap();
        let assembler = Assembler::new(1000, &env);
        let request = LogRequest::new("GET", "https://example.com/");
        let ctx = RequestContext::new(&request);
        let record = assembler.assemble(&ctx, None, Utc::now());

        let snapshot: serde_json::Value =
            serde_json::from_str(record.get_str("environment").unwrap()).unwrap();
        assert_eq!(snapshot["REGION"], "eu-west");
        assert_eq!(snapshot["MAX_BATCH_SIZE"], 200);
        assert_eq!(snapshot["DEBUG"], false);
        assert!(snapshot.get("SECRET_BINDING").is_none());
        assert!(snapshot.get("EMPTY").is_none());
    }

    #[test]
    fn test_caller_data_serialized() {
        let request = LogRequest::new("GET", "https://example.com/");
        let ctx = RequestContext::new(&request);
        let data = json!({"orderId": 42});
        let record = assembler().assemble(&ctx, Some(&data), Utc::now());
        assert_eq!(record.get_str("data"), Some("{\"orderId\":42}"));
    }

    #[test]
    fn test_timing_and_identifiers() {
        let request = LogRequest::new("GET", "https://example.com/x")
            .with_header("CF-Ray", "8a1b2c3d4e5f-AMS");
        let started = Utc::now();
        let ctx = RequestContext::new(&request);
        let record = assembler().assemble(&ctx, None, started);

        assert_eq!(record.get_str("rayId"), Some("8a1b2c3d4e5f-AMS"));
        assert_eq!(record.get_int("requestTime"), Some(started.timestamp_millis()));
        assert_eq!(record.get_str("receivedAt"), Some(iso8601(started).as_str()));
        assert!(record.log_id().starts_with(&format!("{:013}", started.timestamp_millis())));
        assert!(record.get_int("processingDurationMs").unwrap() >= 0);
    }

    #[test]
    fn test_cookie_identifiers() {
        let request = LogRequest::new("GET", "https://example.com/")
            .with_header("Cookie", "cId=c1; sId=s1; fpID=fp9; uID=u3");
        let record = assemble(&request);
        assert_eq!(record.get_str("cId"), Some("c1"));
        assert_eq!(record.get_str("sId"), Some("s1"));
        assert_eq!(record.get_str("fpID"), Some("fp9"));
        assert_eq!(record.get_str("uID"), Some("u3"));
        assert_eq!(*record.get("emID"), FieldValue::Null);
    }
}
