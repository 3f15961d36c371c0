//! LinkedIn → Matrix rendering.

use std::sync::Arc;

use lima_linkedin::Urn;
use lima_linkedin::types::{AttributedBody, FeedUpdate, SpInmailContent};
use lima_matrix::types::MessageContent;

use super::html_escape;
use crate::Bridge;

enum Segment {
    Plain(String),
    Mention { text: String, urn: Urn },
}

/// Render an attributed body as Matrix content. The result carries HTML only
/// when it differs from the escaped plain body.
pub async fn linkedin_to_matrix(bridge: &Arc<Bridge>, body: &AttributedBody) -> MessageContent {
    let mut text = body.text.clone();

    // Walk attributes right-to-left so earlier offsets stay valid while the
    // tail is split off.
    let mut mentions: Vec<_> = body
        .attributes
        .iter()
        .filter_map(|a| a.mention_urn().map(|urn| (a.start, a.length, urn.clone())))
        .collect();
    mentions.sort_by(|a, b| b.0.cmp(&a.0));

    let mut segments: Vec<Segment> = Vec::new();
    for (start, length, urn) in mentions {
        let chars: Vec<char> = text.chars().collect();
        if start + length > chars.len() {
            continue;
        }
        let after: String = chars[start + length..].iter().collect();
        let original: String = chars[start..start + length].iter().collect();
        text = chars[..start].iter().collect();
        segments.push(Segment::Plain(after));
        segments.push(Segment::Mention { text: original, urn });
    }
    segments.push(Segment::Plain(text));

    let mut html = String::new();
    for segment in segments.iter().rev() {
        match segment {
            Segment::Plain(plain) => html.push_str(&html_escape(plain)),
            Segment::Mention { text, urn } => {
                let mxid = resolve_mention(bridge, urn).await;
                let display = if text.starts_with('@') {
                    text.clone()
                } else {
                    format!("@{text}")
                };
                match mxid {
                    Some(mxid) => {
                        html.push_str(&format!(
                            "<a href=\"https://matrix.to/#/{mxid}\">{display}</a>"
                        ));
                    }
                    None => html.push_str(&display),
                }
            }
        }
    }
    let html = html.replace('\n', "<br/>");

    if html != html_escape(&body.text).replace('\n', "<br/>") {
        MessageContent::html(body.text.clone(), html)
    } else {
        MessageContent::text(body.text.clone())
    }
}

/// Logged-in users win over ghosts so self-mentions point at the real account.
async fn resolve_mention(bridge: &Arc<Bridge>, urn: &Urn) -> Option<String> {
    if let Ok(Some(user)) = bridge.get_user_by_urn(urn).await {
        return Some(user.mxid.clone());
    }
    if let Ok(Some(puppet)) = bridge.get_puppet_by_urn(urn, false).await {
        return Some(puppet.default_mxid.clone());
    }
    None
}

/// Bolded subject line preceding the message body.
pub fn linkedin_subject_to_matrix(subject: &str) -> MessageContent {
    MessageContent::html(subject.to_owned(), format!("<b>{}</b>", html_escape(subject)))
}

/// Sponsored InMail block: advertiser label, body, optional call-to-action
/// link, and the legal text.
pub fn linkedin_spinmail_to_matrix(content: &SpInmailContent) -> MessageContent {
    let mut plain = String::new();
    let mut html = String::new();

    if !content.advertiser_label.is_empty() {
        plain.push_str(&format!("{}\n\n", content.advertiser_label));
        html.push_str(&format!("<i>{}</i><br/><br/>", html_escape(&content.advertiser_label)));
    }

    plain.push_str(&content.body);
    // The body is pre-rendered HTML on the wire.
    html.push_str(&content.body);

    if let Some(standard) = content.sub_content.as_ref().and_then(|s| s.standard.as_ref()) {
        if !standard.action.is_empty() {
            plain.push_str(&format!("\n\n{}: {}", standard.action_text, standard.action));
            html.push_str(&format!(
                "<br/><br/><a href=\"{}\">{}</a>",
                standard.action,
                html_escape(&standard.action_text)
            ));
        }
    }

    if let Some(legal) = &content.legal_text {
        for text in [&legal.static_legal_text, &legal.custom_legal_text] {
            if !text.is_empty() {
                plain.push_str(&format!("\n\n{text}"));
                html.push_str(&format!("<br/><br/><sub>{}</sub>", html_escape(text)));
            }
        }
    }

    MessageContent::html(plain, html)
}

/// A shared feed update: commentary text plus the article link.
pub fn linkedin_feed_update_to_matrix(update: &FeedUpdate) -> Option<MessageContent> {
    let commentary = update
        .commentary
        .as_ref()
        .and_then(|c| c.text.as_ref())
        .map(|t| t.text.clone())
        .unwrap_or_default();
    let actor = update
        .actor
        .as_ref()
        .and_then(|a| a.name.as_ref())
        .map(|n| n.text.clone())
        .unwrap_or_default();
    let link = update
        .content
        .as_ref()
        .and_then(|c| c.article_component.as_ref())
        .and_then(|a| a.navigation_context.as_ref())
        .map(|n| n.action_target.clone())
        .unwrap_or_default();

    if commentary.is_empty() && link.is_empty() {
        return None;
    }

    let mut plain = String::new();
    let mut html = String::new();
    if !actor.is_empty() {
        plain.push_str(&format!("{actor} shared a post:\n"));
        html.push_str(&format!("<b>{}</b> shared a post:<br/>", html_escape(&actor)));
    }
    plain.push_str(&commentary);
    html.push_str(&html_escape(&commentary).replace('\n', "<br/>"));
    if !link.is_empty() {
        plain.push_str(&format!("\n{link}"));
        html.push_str(&format!("<br/><a href=\"{link}\">{}</a>", html_escape(&link)));
    }

    Some(MessageContent::html(plain, html))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pure-segment checks without a Bridge: the split algorithm itself.
    fn split(body: &AttributedBody) -> Vec<(bool, String)> {
        let mut text = body.text.clone();
        let mut mentions: Vec<_> = body
            .attributes
            .iter()
            .filter_map(|a| a.mention_urn().map(|u| (a.start, a.length, u.clone())))
            .collect();
        mentions.sort_by(|a, b| b.0.cmp(&a.0));
        let mut segments = Vec::new();
        for (start, length, _) in mentions {
            let chars: Vec<char> = text.chars().collect();
            if start + length > chars.len() {
                continue;
            }
            segments.push((false, chars[start + length..].iter().collect()));
            segments.push((true, chars[start..start + length].iter().collect()));
            text = chars[..start].iter().collect();
        }
        segments.push((false, text));
        segments.reverse();
        segments
    }

    #[test]
    fn mention_splitting_preserves_order_and_offsets() {
        let body = AttributedBody {
            text: "Hey @X".to_owned(),
            attributes: vec![lima_linkedin::types::Attribute::mention(
                4,
                2,
                Urn::new("urn:li:fs_miniProfile:X"),
            )],
        };
        let segments = split(&body);
        assert_eq!(segments[0], (false, "Hey ".to_owned()));
        assert_eq!(segments[1], (true, "@X".to_owned()));
        assert_eq!(segments[2], (false, "".to_owned()));
    }

    #[test]
    fn multibyte_text_splits_on_scalar_offsets() {
        // "héllo @X" — offsets count chars, not bytes.
        let body = AttributedBody {
            text: "héllo @X".to_owned(),
            attributes: vec![lima_linkedin::types::Attribute::mention(
                6,
                2,
                Urn::new("X"),
            )],
        };
        let segments = split(&body);
        assert_eq!(segments[1], (true, "@X".to_owned()));
    }

    #[test]
    fn subject_renders_bold() {
        let content = linkedin_subject_to_matrix("Job <offer>");
        assert_eq!(content.formatted_body.as_deref(), Some("<b>Job &lt;offer&gt;</b>"));
        assert_eq!(content.body, "Job <offer>");
    }

    #[test]
    fn feed_update_without_content_is_none() {
        assert!(linkedin_feed_update_to_matrix(&FeedUpdate::default()).is_none());
    }
}
