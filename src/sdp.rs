//! SDP Codec Hint
//!
//! Rewrites Opus `a=fmtp` lines on every outgoing offer so the mesh runs
//! mono at a bounded average bitrate with in-band FEC. The transform is
//! idempotent.

use regex::Regex;
use std::sync::OnceLock;

/// Parameters appended to every Opus fmtp line.
const OPUS_PARAMS: [(&str, &str); 3] = [
    ("maxaveragebitrate", "60000"),
    ("stereo", "0"),
    ("useinbandfec", "1"),
];

fn rtpmap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^a=rtpmap:(\d+)\s+opus/").expect("static regex"))
}

fn fmtp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^a=fmtp:(\d+)\s+(.*)$").expect("static regex"))
}

/// Apply the Opus parameter hint to an SDP body.
pub fn apply_opus_hints(sdp: &str) -> String {
    let opus_payloads: Vec<String> = sdp
        .lines()
        .filter_map(|line| rtpmap_re().captures(line))
        .map(|caps| caps[1].to_string())
        .collect();

    if opus_payloads.is_empty() {
        return sdp.to_string();
    }

    let ends_with_newline = sdp.ends_with('\n');
    let mut out: Vec<String> = Vec::new();
    for line in sdp.lines() {
        match fmtp_re().captures(line) {
            Some(caps) if opus_payloads.contains(&caps[1].to_string()) => {
                out.push(rewrite_fmtp(&caps[1], &caps[2]));
            }
            _ => out.push(line.to_string()),
        }
    }

    let mut joined = out.join("\r\n");
    if ends_with_newline {
        joined.push_str("\r\n");
    }
    joined
}

/// Rebuild one fmtp parameter list with the canonical Opus hints, dropping
/// any prior values for the same keys.
fn rewrite_fmtp(payload: &str, params: &str) -> String {
    let mut kept: Vec<&str> = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let key = p.split('=').next().unwrap_or("");
            !OPUS_PARAMS.iter().any(|(k, _)| key.eq_ignore_ascii_case(k))
        })
        .collect();

    let appended: Vec<String> = OPUS_PARAMS.iter().map(|(k, v)| format!("{k}={v}")).collect();
    kept.extend(appended.iter().map(String::as_str));
    format!("a=fmtp:{payload} {}", kept.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:103 ISAC/16000\r\n\
        a=fmtp:103 bitrate=32000\r\n";

    #[test]
    fn appends_opus_params() {
        let out = apply_opus_hints(SDP);
        assert!(out.contains(
            "a=fmtp:111 minptime=10;maxaveragebitrate=60000;stereo=0;useinbandfec=1"
        ));
        // Non-Opus payloads untouched.
        assert!(out.contains("a=fmtp:103 bitrate=32000"));
    }

    #[test]
    fn transform_is_idempotent() {
        let once = apply_opus_hints(SDP);
        let twice = apply_opus_hints(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sdp_without_opus_is_unchanged() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n";
        assert_eq!(apply_opus_hints(sdp), sdp);
    }

    #[test]
    fn replaces_conflicting_values() {
        let sdp = "a=rtpmap:111 opus/48000/2\r\na=fmtp:111 stereo=1;maxaveragebitrate=128000\r\n";
        let out = apply_opus_hints(sdp);
        assert!(out.contains("maxaveragebitrate=60000"));
        assert!(out.contains("stereo=0"));
        assert!(!out.contains("stereo=1"));
        assert!(!out.contains("128000"));
    }
}
