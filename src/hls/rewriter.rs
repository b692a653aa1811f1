//! Line-oriented M3U8 rewriting.
//!
//! The playlist is never parsed into a tree. Each line is classified on its
//! own and either copied through or has its URI replaced by a proxied one,
//! so unknown tags, comments, odd whitespace and `\r\n` endings all survive
//! byte-for-byte. The output has exactly as many lines as the input.

use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const BOM: char = '\u{feff}';

/// `URI="…"` / `URL="…"` attributes inside `#EXT` tags.
static URI_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\b(URI|URL)="([^"]*)""#).expect("static regex"));

/// One playlist line without its terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistLine<'a> {
    /// Starts with `#`: a tag or a comment.
    Directive(&'a str),
    Blank(&'a str),
    /// Anything else is a media or playlist reference.
    Uri(&'a str),
}

impl<'a> PlaylistLine<'a> {
    pub fn classify(content: &'a str) -> Self {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            Self::Blank(content)
        } else if trimmed.starts_with('#') {
            Self::Directive(content)
        } else {
            Self::Uri(content)
        }
    }
}

/// Why a reference was left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("empty reference")]
    Empty,
    #[error("cannot resolve {reference:?}: {reason}")]
    Unresolvable { reference: String, reason: String },
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
}

/// Result of rewriting a whole playlist.
#[derive(Debug, Clone)]
pub struct RewrittenPlaylist {
    pub body: String,
    /// Lines in the input (and therefore in `body`).
    pub lines: usize,
    pub lines_rewritten: usize,
}

/// Where references resolve from, and where they are sent to.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    base: Url,
    proxy_base: String,
}

fn is_absolute_http(reference: &str) -> bool {
    let prefix = |p: &str| {
        reference
            .get(..p.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(p))
    };
    prefix("http://") || prefix("https://")
}

/// Split off the `\n` or `\r\n` terminator.
fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(content) = raw.strip_suffix("\r\n") {
        (content, "\r\n")
    } else if let Some(content) = raw.strip_suffix('\n') {
        (content, "\n")
    } else {
        (raw, "")
    }
}

impl RewriteContext {
    /// `base` is the playlist's own URL (after redirects); `proxy_base` is
    /// the relay's scheme + host + path with no query string.
    pub fn new(base: Url, proxy_base: impl Into<String>) -> Self {
        Self {
            base,
            proxy_base: proxy_base.into(),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn proxy_base(&self) -> &str {
        &self.proxy_base
    }

    /// Resolve a reference against the playlist URL.
    ///
    /// Absolute, rooted, relative and scheme-relative forms all go through
    /// `Url::join`. Only `http`/`https` results are accepted.
    pub fn resolve(&self, reference: &str) -> Result<Url, RewriteError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(RewriteError::Empty);
        }
        let resolved = self
            .base
            .join(reference)
            .map_err(|e| RewriteError::Unresolvable {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        match resolved.scheme() {
            "http" | "https" => Ok(resolved),
            other => Err(RewriteError::UnsupportedScheme(other.to_string())),
        }
    }

    /// The absolute URL text that goes into the proxied link.
    ///
    /// `http(s)://` references are only checked for parseability and then
    /// kept byte-for-byte, so signed URLs survive untouched. Anything else
    /// goes through [`RewriteContext::resolve`].
    pub fn target_for<'r>(&self, reference: &'r str) -> Result<Cow<'r, str>, RewriteError> {
        let reference = reference.trim();
        if is_absolute_http(reference) {
            return Url::parse(reference)
                .map(|_| Cow::Borrowed(reference))
                .map_err(|e| RewriteError::Unresolvable {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                });
        }
        self.resolve(reference).map(|url| Cow::Owned(url.into()))
    }

    /// `<proxy_base>?url=<percent-encoded absolute URL>`
    pub fn proxied(&self, target: &str) -> String {
        format!("{}?url={}", self.proxy_base, urlencoding::encode(target))
    }

    fn rewrite_reference<'r>(&self, reference: &'r str) -> Cow<'r, str> {
        match self.target_for(reference) {
            Ok(target) => Cow::Owned(self.proxied(&target)),
            Err(e @ RewriteError::UnsupportedScheme(_)) => {
                debug!("Leaving reference {:?} unchanged: {}", reference, e);
                Cow::Borrowed(reference)
            }
            Err(e) => {
                warn!("Leaving reference {:?} unchanged: {}", reference, e);
                Cow::Borrowed(reference)
            }
        }
    }

    fn rewrite_directive<'l>(&self, content: &'l str) -> Cow<'l, str> {
        if !content.trim_start().starts_with("#EXT") {
            return Cow::Borrowed(content);
        }

        let mut changed = false;
        let rewritten = URI_ATTRIBUTE.replace_all(content, |caps: &Captures| {
            let value = &caps[2];
            match self.rewrite_reference(value) {
                Cow::Owned(proxied) => {
                    changed = true;
                    format!("{}=\"{}\"", &caps[1], proxied)
                }
                Cow::Borrowed(_) => caps[0].to_string(),
            }
        });

        if changed {
            Cow::Owned(rewritten.into_owned())
        } else {
            Cow::Borrowed(content)
        }
    }

    fn rewrite_content<'l>(&self, content: &'l str) -> Cow<'l, str> {
        // A BOM only ever sits on the first line; keep it, classify without it.
        let (bom, body) = match content.strip_prefix(BOM) {
            Some(rest) => (&content[..BOM.len_utf8()], rest),
            None => ("", content),
        };

        let rewritten = match PlaylistLine::classify(body) {
            PlaylistLine::Blank(_) => return Cow::Borrowed(content),
            PlaylistLine::Directive(line) => self.rewrite_directive(line),
            PlaylistLine::Uri(line) => self.rewrite_reference(line.trim()),
        };

        match rewritten {
            Cow::Owned(line) => Cow::Owned(format!("{}{}", bom, line)),
            Cow::Borrowed(_) => Cow::Borrowed(content),
        }
    }

    /// Rewrite one raw line, terminator included.
    ///
    /// Returns `Cow::Borrowed` when the line is unchanged.
    pub fn rewrite_line<'l>(&self, raw: &'l str) -> Cow<'l, str> {
        let (content, terminator) = split_terminator(raw);
        match self.rewrite_content(content) {
            Cow::Owned(line) => Cow::Owned(line + terminator),
            Cow::Borrowed(_) => Cow::Borrowed(raw),
        }
    }

    /// Lazily rewrite every line of `text`, terminators preserved.
    pub fn rewrite_lines<'a>(&'a self, text: &'a str) -> impl Iterator<Item = Cow<'a, str>> + 'a {
        text.split_inclusive('\n').map(|raw| self.rewrite_line(raw))
    }

    pub fn rewrite_playlist(&self, text: &str) -> RewrittenPlaylist {
        let mut body = String::with_capacity(text.len() + text.len() / 2);
        let mut lines = 0;
        let mut lines_rewritten = 0;

        for line in self.rewrite_lines(text) {
            lines += 1;
            if let Cow::Owned(_) = line {
                lines_rewritten += 1;
            }
            body.push_str(&line);
        }

        debug!(
            "Rewrote {}/{} playlist lines (base {})",
            lines_rewritten, lines, self.base
        );

        RewrittenPlaylist {
            body,
            lines,
            lines_rewritten,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(base: &str) -> RewriteContext {
        RewriteContext::new(Url::parse(base).unwrap(), "https://proxy/")
    }

    /// Pull the `url` query value back out of a proxied line.
    fn decode_target(line: &str) -> String {
        let query = line.trim_end().split_once("?url=").unwrap().1;
        urlencoding::decode(query).unwrap().into_owned()
    }

    const MEDIA_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:6.0,
seg1.ts
#EXTINF:6.0,
https://host/seg2.ts
#EXTINF:6.0,
/seg3.ts
#EXT-X-ENDLIST
";

    // -- worked example ------------------------------------------------------

    #[test]
    fn test_rewrites_relative_absolute_and_rooted_segments() {
        let out = ctx("https://host/path/live.m3u8").rewrite_playlist(MEDIA_PLAYLIST);

        let expected = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:6.0,
https://proxy/?url=https%3A%2F%2Fhost%2Fpath%2Fseg1.ts
#EXTINF:6.0,
https://proxy/?url=https%3A%2F%2Fhost%2Fseg2.ts
#EXTINF:6.0,
https://proxy/?url=https%3A%2F%2Fhost%2Fseg3.ts
#EXT-X-ENDLIST
";
        assert_eq!(out.body, expected);
        assert_eq!(out.lines, 12);
        assert_eq!(out.lines_rewritten, 3);
    }

    // -- line classification -------------------------------------------------

    #[test]
    fn test_classify_lines() {
        assert_eq!(PlaylistLine::classify("#EXTINF:4,"), PlaylistLine::Directive("#EXTINF:4,"));
        assert_eq!(PlaylistLine::classify("# comment"), PlaylistLine::Directive("# comment"));
        assert_eq!(PlaylistLine::classify("   "), PlaylistLine::Blank("   "));
        assert_eq!(PlaylistLine::classify("a.ts"), PlaylistLine::Uri("a.ts"));
    }

    #[test]
    fn test_directives_without_uri_are_byte_identical() {
        let c = ctx("https://host/path/live.m3u8");
        for line in [
            "#EXTM3U\n",
            "#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00.000Z\n",
            "#EXT-X-DATERANGE:ID=\"ad\",START-DATE=\"2024-01-01T00:00:00Z\"\r\n",
            "# just a comment with URI=\"x.ts\"\n",
            "\n",
            "\r\n",
        ] {
            assert!(matches!(c.rewrite_line(line), Cow::Borrowed(l) if l == line), "{:?}", line);
        }
    }

    // -- attributes ----------------------------------------------------------

    #[test]
    fn test_rewrites_key_and_map_uri_attributes() {
        let c = ctx("https://host/path/live.m3u8");

        let key = c.rewrite_line("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x1\n");
        assert_eq!(
            key,
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://proxy/?url=https%3A%2F%2Fhost%2Fpath%2Fkey.bin\",IV=0x1\n"
        );

        let map = c.rewrite_line("#EXT-X-MAP:URI=\"/init.mp4\"");
        assert_eq!(map, "#EXT-X-MAP:URI=\"https://proxy/?url=https%3A%2F%2Fhost%2Finit.mp4\"");
    }

    #[test]
    fn test_rewrites_media_and_url_attributes() {
        let c = ctx("https://host/master.m3u8");
        let line = "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"en\",URI=\"audio/en.m3u8\"";
        let out = c.rewrite_line(line);
        assert!(out.starts_with("#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"en\",URI=\"https://proxy/?url="));
        assert_eq!(
            decode_target(out.trim_end_matches('"')),
            "https://host/audio/en.m3u8"
        );

        let session = c.rewrite_line("#EXT-X-SESSION-DATA:DATA-ID=\"x\",URL=\"data.json\"");
        assert!(session.contains("URL=\"https://proxy/?url=https%3A%2F%2Fhost%2Fdata.json\""));
    }

    #[test]
    fn test_non_http_attribute_left_unchanged() {
        let c = ctx("https://host/path/live.m3u8");
        let line = "#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key-id-42\",KEYFORMAT=\"com.apple.streamingkeydelivery\"";
        assert!(matches!(c.rewrite_line(line), Cow::Borrowed(_)));

        let data = "#EXT-X-KEY:METHOD=AES-128,URI=\"data:text/plain;base64,AAAA\"";
        assert!(matches!(c.rewrite_line(data), Cow::Borrowed(_)));
    }

    // -- resolution ----------------------------------------------------------

    #[test]
    fn test_scheme_relative_inherits_scheme() {
        let c = ctx("http://host/path/live.m3u8");
        let resolved = c.resolve("//cdn.example.com/a.ts").unwrap();
        assert_eq!(resolved.as_str(), "http://cdn.example.com/a.ts");
    }

    #[test]
    fn test_parent_directory_and_query_preserved() {
        let c = ctx("https://host/a/b/live.m3u8?token=xyz");
        assert_eq!(
            c.resolve("../seg.ts?part=1&sig=a%2Fb").unwrap().as_str(),
            "https://host/a/seg.ts?part=1&sig=a%2Fb"
        );
    }

    #[test]
    fn test_unsupported_and_empty_references() {
        let c = ctx("https://host/live.m3u8");
        assert_eq!(
            c.resolve("data:video/mp2t;base64,AAAA"),
            Err(RewriteError::UnsupportedScheme("data".to_string()))
        );
        assert_eq!(c.resolve("  "), Err(RewriteError::Empty));
        assert!(matches!(c.rewrite_line("skd://abc\n"), Cow::Borrowed("skd://abc\n")));
    }

    #[test]
    fn test_absolute_reference_kept_verbatim() {
        let c = ctx("https://host/path/live.m3u8");
        let signed = "HTTPS://CDN.Example.com:443/a/../seg%2f1.ts?Signature=AbC~d&Expires=1";
        let out = c.rewrite_line(signed);
        assert_eq!(decode_target(&out), signed);
    }

    #[test]
    fn test_malformed_reference_left_unchanged() {
        let c = ctx("https://host/path/live.m3u8");
        assert!(matches!(
            c.target_for("http://[::1"),
            Err(RewriteError::Unresolvable { .. })
        ));

        for line in ["http://[::1\n", "//[::1/seg.ts\n"] {
            assert!(matches!(c.rewrite_line(line), Cow::Borrowed(l) if l == line), "{:?}", line);
        }

        let key = "#EXT-X-KEY:METHOD=AES-128,URI=\"http://[::1\",IV=0x1\n";
        assert!(matches!(c.rewrite_line(key), Cow::Borrowed(l) if l == key));

        // Only the broken line is skipped
        let playlist = "#EXTM3U\nhttp://[::1\nok.ts\n";
        let out = c.rewrite_playlist(playlist);
        assert_eq!(out.lines, 3);
        assert_eq!(out.lines_rewritten, 1);
        assert!(out.body.contains("\nhttp://[::1\n"));
    }

    // -- terminators and edge cases ------------------------------------------

    #[test]
    fn test_crlf_preserved() {
        let input = "#EXTM3U\r\n#EXTINF:4,\r\nseg1.ts\r\n";
        let out = ctx("https://host/path/live.m3u8").rewrite_playlist(input);
        assert_eq!(
            out.body,
            "#EXTM3U\r\n#EXTINF:4,\r\nhttps://proxy/?url=https%3A%2F%2Fhost%2Fpath%2Fseg1.ts\r\n"
        );
    }

    #[test]
    fn test_missing_final_newline_not_added() {
        let out = ctx("https://host/live.m3u8").rewrite_playlist("#EXTM3U\nseg.ts");
        assert!(out.body.ends_with("seg.ts"));
        assert_eq!(out.lines, 2);
    }

    #[test]
    fn test_bom_kept_on_first_line() {
        let input = "\u{feff}#EXTM3U\nseg.ts\n";
        let out = ctx("https://host/live.m3u8").rewrite_playlist(input);
        assert!(out.body.starts_with("\u{feff}#EXTM3U\n"));
        assert_eq!(out.lines_rewritten, 1);
    }

    #[test]
    fn test_uri_line_whitespace_trimmed() {
        let out = ctx("https://host/live.m3u8").rewrite_line("  seg.ts \n");
        assert_eq!(out, "https://proxy/?url=https%3A%2F%2Fhost%2Fseg.ts\n");
    }

    #[test]
    fn test_empty_playlist() {
        let out = ctx("https://host/live.m3u8").rewrite_playlist("");
        assert_eq!(out.body, "");
        assert_eq!(out.lines, 0);
    }

    // -- invariants ----------------------------------------------------------

    #[test]
    fn test_line_count_and_round_trip() {
        let c = ctx("https://host/path/live.m3u8");
        let input = "#EXTM3U\n\n#EXTINF:2,\nlow/seg 1.ts\n#EXTINF:2,\nhttps://other.example/x.ts?a=1&b=2\n";
        let output: Vec<_> = c.rewrite_lines(input).collect();
        assert_eq!(output.len(), input.split_inclusive('\n').count());

        for (original, rewritten) in input.split_inclusive('\n').zip(&output) {
            if let Cow::Owned(line) = rewritten {
                let expected = c.target_for(original).unwrap();
                assert_eq!(decode_target(line), expected);
            } else {
                assert_eq!(*rewritten, original);
            }
        }
    }

    #[test]
    fn test_rewritten_master_playlist_parses() {
        let master = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1280x720
high/index.m3u8
";
        let out = ctx("https://host/master.m3u8").rewrite_playlist(master);
        match m3u8_rs::parse_playlist_res(out.body.as_bytes()) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(pl)) => {
                assert_eq!(pl.variants.len(), 2);
                assert_eq!(
                    decode_target(&pl.variants[0].uri),
                    "https://host/low/index.m3u8"
                );
            }
            other => panic!("expected a master playlist, got {:?}", other.is_ok()),
        }
    }
}
