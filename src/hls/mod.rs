//! HLS playlist handling: classification of upstream responses and
//! line-level URI rewriting.

pub mod classify;
pub mod rewriter;

pub use classify::{Verdict, classify, passthrough_content_type, sniff_playlist};
pub use rewriter::{PlaylistLine, RewriteContext, RewriteError, RewrittenPlaylist};
