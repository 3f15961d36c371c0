//! Bidirectional translation between LinkedIn's attributed-text bodies and
//! Matrix HTML/plain content.
//!
//! Offsets in attribute ranges count Unicode scalar values, matching the
//! upstream wire format.

mod from_linkedin;
mod from_matrix;

pub use from_linkedin::{
    linkedin_feed_update_to_matrix, linkedin_spinmail_to_matrix, linkedin_subject_to_matrix,
    linkedin_to_matrix,
};
pub use from_matrix::matrix_to_linkedin;

/// Escape text for embedding in Matrix HTML bodies.
pub(crate) fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
