//! Codec filtering for remote session descriptions.
//!
//! Some display decoders advertise codecs they cannot sustain. Rather than
//! touch the engine's codec preferences, the offer is rewritten before it is
//! applied: every payload type bound to a filtered codec is removed, together
//! with retransmission formats (`apt=`) that depend on it.
//!
//! ```text
//! m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99      m=video 9 UDP/TLS/RTP/SAVPF 96 97
//! a=rtpmap:96 VP8/90000                        a=rtpmap:96 VP8/90000
//! a=rtpmap:97 rtx/90000                  ──►   a=rtpmap:97 rtx/90000
//! a=fmtp:97 apt=96                             a=fmtp:97 apt=96
//! a=rtpmap:98 H265/90000
//! a=rtcp-fb:98 nack
//! a=rtpmap:99 rtx/90000
//! a=fmtp:99 apt=98
//! ```

use std::collections::HashSet;

/// Attribute lines keyed by payload type.
const FORMAT_ATTRIBUTES: &[&str] = &["a=rtpmap:", "a=fmtp:", "a=rtcp-fb:"];

/// Remove every codec in `codecs` from `sdp`.
pub fn filter_codecs<S: AsRef<str>>(sdp: &str, codecs: &[S]) -> String {
    codecs
        .iter()
        .fold(sdp.to_owned(), |acc, codec| filter_codec(&acc, codec.as_ref()))
}

/// Remove one codec (matched case-insensitively against the `a=rtpmap`
/// encoding name) from `sdp`. Returns the input unchanged when the codec is
/// not offered.
pub fn filter_codec(sdp: &str, codec: &str) -> String {
    let ids = payload_types_for(sdp, codec);
    if ids.is_empty() {
        return sdp.to_owned();
    }

    let mut out = String::with_capacity(sdp.len());
    for raw in sdp.split_inclusive('\n') {
        let (line, ending) = split_ending(raw);

        if let Some(pt) = attribute_payload_type(line) {
            if ids.contains(pt) {
                continue;
            }
        }

        if line.starts_with("m=") {
            out.push_str(&strip_formats(line, &ids));
            out.push_str(ending);
            continue;
        }

        out.push_str(raw);
    }
    out
}

/// Payload types bound to `codec`, plus formats whose `apt=` points at one.
fn payload_types_for<'a>(sdp: &'a str, codec: &str) -> HashSet<&'a str> {
    let mut ids = HashSet::new();

    for line in sdp.lines() {
        let Some(rest) = line.trim_end().strip_prefix("a=rtpmap:") else { continue };
        let mut parts = rest.splitn(2, ' ');
        let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) else { continue };
        let name = encoding.split('/').next().unwrap_or_default();
        if name.eq_ignore_ascii_case(codec) {
            ids.insert(pt);
        }
    }

    if ids.is_empty() {
        return ids;
    }

    let mut dependents = Vec::new();
    for line in sdp.lines() {
        let Some(rest) = line.trim_end().strip_prefix("a=fmtp:") else { continue };
        let mut parts = rest.splitn(2, ' ');
        let (Some(pt), Some(params)) = (parts.next(), parts.next()) else { continue };
        let apt = params
            .split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("apt="));
        if apt.map_or(false, |primary| ids.contains(primary)) {
            dependents.push(pt);
        }
    }
    ids.extend(dependents);
    ids
}

/// Payload type of an `a=rtpmap` / `a=fmtp` / `a=rtcp-fb` line.
fn attribute_payload_type(line: &str) -> Option<&str> {
    FORMAT_ATTRIBUTES.iter().find_map(|prefix| {
        line.strip_prefix(prefix)
            .map(|rest| rest.split(|c: char| c.is_ascii_whitespace()).next().unwrap_or(rest))
    })
}

/// `m=<media> <port> <proto> <fmt>...` without the given formats.
fn strip_formats(line: &str, ids: &HashSet<&str>) -> String {
    let mut tokens = line.split(' ');
    let head: Vec<&str> = tokens.by_ref().take(3).collect();
    let formats: Vec<&str> = tokens.filter(|fmt| !ids.contains(fmt)).collect();
    head.into_iter().chain(formats).collect::<Vec<_>>().join(" ")
}

fn split_ending(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98 99 100\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H265/90000\r\n\
a=rtcp-fb:98 nack\r\n\
a=rtcp-fb:98 nack pli\r\n\
a=fmtp:98 level-id=93;profile-id=1\r\n\
a=rtpmap:99 rtx/90000\r\n\
a=fmtp:99 apt=98\r\n\
a=rtpmap:100 AV1/90000\r\n";

    #[test]
    fn removes_codec_and_its_retransmission_format() {
        let filtered = filter_codec(OFFER, "H265");
        assert!(filtered.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97 100\r\n"));
        for gone in ["a=rtpmap:98", "a=rtcp-fb:98", "a=fmtp:98", "a=rtpmap:99", "a=fmtp:99"] {
            assert!(!filtered.contains(gone), "{gone} should be removed");
        }
        for kept in ["a=rtpmap:96 VP8/90000", "a=fmtp:97 apt=96", "a=rtpmap:100 AV1/90000", "a=mid:0"] {
            assert!(filtered.contains(kept), "{kept} should be kept");
        }
    }

    #[test]
    fn filters_several_codecs_in_one_pass() {
        let filtered = filter_codecs(OFFER, &["H265", "AV1"]);
        assert!(filtered.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n"));
        assert!(!filtered.contains("AV1"));
        assert!(!filtered.contains("H265"));
    }

    #[test]
    fn absent_codec_is_a_no_op() {
        assert_eq!(filter_codec(OFFER, "VP9"), OFFER);
        assert_eq!(filter_codecs::<&str>(OFFER, &[]), OFFER);
    }

    #[test]
    fn filtering_is_idempotent() {
        let once = filter_codecs(OFFER, &["H265", "AV1"]);
        let twice = filter_codecs(&once, &["H265", "AV1"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn matches_codec_name_case_insensitively() {
        let filtered = filter_codec(OFFER, "h265");
        assert!(!filtered.contains("a=rtpmap:98"));
    }

    #[test]
    fn keeps_lf_only_line_endings() {
        let lf = OFFER.replace("\r\n", "\n");
        let filtered = filter_codec(&lf, "H265");
        assert!(!filtered.contains('\r'));
        assert!(filtered.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97 100\n"));
        assert!(filtered.ends_with("a=rtpmap:100 AV1/90000\n"));
    }

    #[test]
    fn prefix_payload_types_are_not_confused() {
        let sdp = "m=video 9 RTP/AVP 9 96\r\na=rtpmap:9 H265/90000\r\na=rtpmap:96 VP8/90000\r\na=fmtp:96 x=1\r\n";
        let filtered = filter_codec(sdp, "H265");
        assert_eq!(filtered, "m=video 9 RTP/AVP 96\r\na=rtpmap:96 VP8/90000\r\na=fmtp:96 x=1\r\n");
    }
}
