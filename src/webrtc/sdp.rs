//! SDP codec restriction
//!
//! Rewrites a session description so that one media kind only offers a
//! single codec, plus the retransmission payload types bound to it via
//! `a=fmtp:<pt> apt=<codec pt>`.

/// Restrict every `m=<kind>` section of `sdp` to the payload types whose
/// `rtpmap` names `codec` (exact, case-sensitive) and their RTX companions.
///
/// `rtpmap`, `fmtp` and `rtcp-fb` lines of other payload types are dropped
/// and the `m=` format list is rewritten in first-seen order. Everything
/// outside the matched sections, including line endings, is preserved.
/// If nothing matches, the format list of the section becomes empty.
pub fn filter_codec(kind: &str, codec: &str, sdp: &str) -> String {
    let lines: Vec<&str> = sdp.split_inclusive('\n').collect();
    let mut out = String::with_capacity(sdp.len());

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if !is_media_line_of(content(line), kind) {
            out.push_str(line);
            i += 1;
            continue;
        }

        let end = section_end(&lines, i + 1);
        let section = &lines[i..end];
        let allowed = collect_payload_types(section, codec);

        out.push_str(&rewrite_media_line(line, &allowed));
        for attr in &section[1..] {
            if keep_line(content(attr), &allowed) {
                out.push_str(attr);
            }
        }
        i = end;
    }

    out
}

/// Line text without its `\r\n` / `\n` terminator.
fn content(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn is_media_line_of(line: &str, kind: &str) -> bool {
    line.strip_prefix("m=")
        .and_then(|rest| rest.strip_prefix(kind))
        .map_or(false, |rest| rest.starts_with(' '))
}

fn section_end(lines: &[&str], from: usize) -> usize {
    lines[from..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map_or(lines.len(), |offset| from + offset)
}

/// Parse `a=<attr>:<pt> <rest>` into the payload type and the remainder.
fn attribute_payload_type<'a>(line: &'a str, attr: &str) -> Option<(u8, &'a str)> {
    let value = line.strip_prefix("a=")?.strip_prefix(attr)?.strip_prefix(':')?;
    let (pt, rest) = value.split_once(' ').unwrap_or((value, ""));
    Some((pt.parse().ok()?, rest))
}

fn collect_payload_types(section: &[&str], codec: &str) -> Vec<u8> {
    let mut allowed: Vec<u8> = Vec::new();

    for line in section.iter().map(|l| content(l)) {
        if let Some((pt, rest)) = attribute_payload_type(line, "rtpmap") {
            let name = rest.split('/').next().unwrap_or("");
            if name == codec && !allowed.contains(&pt) {
                allowed.push(pt);
            }
        } else if let Some((pt, rest)) = attribute_payload_type(line, "fmtp") {
            let apt = rest
                .split(';')
                .filter_map(|param| param.trim().strip_prefix("apt="))
                .find_map(|v| v.parse::<u8>().ok());
            if let Some(apt) = apt {
                if allowed.contains(&apt) && !allowed.contains(&pt) {
                    allowed.push(pt);
                }
            }
        }
    }

    allowed
}

fn keep_line(line: &str, allowed: &[u8]) -> bool {
    ["rtpmap", "fmtp", "rtcp-fb"]
        .iter()
        .find_map(|attr| attribute_payload_type(line, attr))
        .map_or(true, |(pt, _)| allowed.contains(&pt))
}

fn rewrite_media_line(line: &str, allowed: &[u8]) -> String {
    let text = content(line);
    let ending = &line[text.len()..];

    let mut tokens = text.split(' ');
    let (Some(media), Some(port), Some(proto)) = (tokens.next(), tokens.next(), tokens.next()) else {
        return line.to_string();
    };

    let mut rewritten = format!("{} {} {}", media, port, proto);
    for pt in allowed {
        rewritten.push(' ');
        rewritten.push_str(&pt.to_string());
    }
    rewritten.push_str(ending);
    rewritten
}
