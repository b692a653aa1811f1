//! Deciding whether an upstream response is an HLS playlist.

use reqwest::StatusCode;
use url::Url;

/// MIME types that identify an M3U8 playlist.
const PLAYLIST_MIME_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// Extension → content-type for passthrough bodies.
const MEDIA_TYPES: &[(&str, &str)] = &[
    (".ts", "video/MP2T"),
    (".m4s", "video/mp4"),
    (".mp4", "video/mp4"),
    (".aac", "audio/aac"),
    (".vtt", "text/vtt"),
];

const PLAYLIST_MARKER: &[u8] = b"#EXTM3U";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How much of an unlabelled body is buffered while looking for `#EXTM3U`.
pub const SNIFF_LIMIT: usize = 1024;

/// Outcome of header-level classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Playlist,
    Passthrough,
    /// Headers are inconclusive; look at the first body chunk.
    Sniff,
}

/// Classify from status, declared content-type and the response URL.
pub fn classify(status: StatusCode, content_type: Option<&str>, url: &Url) -> Verdict {
    if !status.is_success() {
        return Verdict::Passthrough;
    }
    if is_playlist_content_type(content_type) || has_playlist_extension(url) {
        return Verdict::Playlist;
    }
    if has_media_extension(url) {
        return Verdict::Passthrough;
    }
    Verdict::Sniff
}

pub fn is_playlist_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    PLAYLIST_MIME_TYPES.contains(&mime.as_str())
}

pub fn has_playlist_extension(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".m3u8") || path.ends_with(".m3u")
}

/// True if the chunk contains the `#EXTM3U` marker.
pub fn sniff_playlist(chunk: &[u8]) -> bool {
    chunk
        .windows(PLAYLIST_MARKER.len())
        .any(|window| window == PLAYLIST_MARKER)
}

/// True for segment, init, audio and subtitle paths that are never playlists.
pub fn has_media_extension(url: &Url) -> bool {
    media_type_for(url).is_some()
}

fn media_type_for(url: &Url) -> Option<&'static str> {
    let path = url.path().to_ascii_lowercase();
    MEDIA_TYPES
        .iter()
        .find(|(ext, _)| path.ends_with(ext))
        .map(|(_, mime)| *mime)
}

/// Content-type to send with a passthrough body: the media table entry for
/// the URL's extension, else `application/octet-stream`. The upstream value
/// is never echoed.
pub fn passthrough_content_type(url: &Url) -> &'static str {
    media_type_for(url).unwrap_or(DEFAULT_CONTENT_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn mpegurl_content_type_is_playlist() {
        let verdict = classify(
            StatusCode::OK,
            Some("application/vnd.apple.mpegurl; charset=utf-8"),
            &url("https://cdn.example.com/stream"),
        );
        assert_eq!(verdict, Verdict::Playlist);
        assert!(is_playlist_content_type(Some("Application/X-MpegURL")));
        assert!(is_playlist_content_type(Some("audio/mpegurl")));
    }

    #[test]
    fn m3u8_extension_is_playlist_regardless_of_type() {
        let verdict = classify(
            StatusCode::OK,
            Some("text/plain"),
            &url("https://cdn.example.com/live/Index.M3U8?token=abc"),
        );
        assert_eq!(verdict, Verdict::Playlist);
    }

    #[test]
    fn error_status_is_never_playlist() {
        let verdict = classify(
            StatusCode::NOT_FOUND,
            Some("application/vnd.apple.mpegurl"),
            &url("https://cdn.example.com/live.m3u8"),
        );
        assert_eq!(verdict, Verdict::Passthrough);
    }

    #[test]
    fn media_extension_skips_sniff() {
        let verdict = classify(StatusCode::OK, None, &url("https://cdn.example.com/seg1.ts"));
        assert_eq!(verdict, Verdict::Passthrough);
    }

    #[test]
    fn unknown_resource_needs_sniff() {
        let verdict = classify(
            StatusCode::OK,
            Some("application/octet-stream"),
            &url("https://cdn.example.com/playlist?id=42"),
        );
        assert_eq!(verdict, Verdict::Sniff);
    }

    #[test]
    fn sniff_finds_marker() {
        assert!(sniff_playlist(b"\xEF\xBB\xBF#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(!sniff_playlist(b"\x47\x40\x00\x10"));
        assert!(!sniff_playlist(b""));
    }

    #[test]
    fn passthrough_type_table() {
        let cases = [
            ("https://c.example/a.ts", "video/MP2T"),
            ("https://c.example/a.m4s", "video/mp4"),
            ("https://c.example/a.mp4", "video/mp4"),
            ("https://c.example/a.aac", "audio/aac"),
            ("https://c.example/subs/en.vtt", "text/vtt"),
        ];
        for (u, expected) in cases {
            assert_eq!(passthrough_content_type(&url(u)), expected, "{}", u);
        }
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        assert_eq!(
            passthrough_content_type(&url("https://c.example/key.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            passthrough_content_type(&url("https://c.example/page")),
            "application/octet-stream"
        );
    }

    #[test]
    fn sniff_tolerates_leading_whitespace() {
        assert!(!sniff_playlist(b"#EX"));
        assert!(sniff_playlist(b"  \r\n#EXTM3U"));
    }
}
