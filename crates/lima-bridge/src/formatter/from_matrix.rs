//! Matrix → LinkedIn rendering: parse the HTML body into plain text plus
//! mention attributes.

use std::sync::Arc;

use anyhow::{Context, Result};
use lima_linkedin::types::{Attribute, AttributedBody, MessageCreate};
use lima_matrix::types::{FORMAT_HTML, MSGTYPE_EMOTE, MessageContent};
use scraper::{Html, Node};
use tracing::warn;

use crate::Bridge;
use crate::user::User;

const MATRIX_TO_PREFIX: &str = "https://matrix.to/#/";

#[derive(Debug, Default)]
struct ParsedHtml {
    text: String,
    /// Offset/length in Unicode scalar values.
    mentions: Vec<MentionEntity>,
}

#[derive(Debug)]
struct MentionEntity {
    offset: usize,
    length: usize,
    user_id: String,
}

impl ParsedHtml {
    fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    fn push(&mut self, text: &str) {
        self.text.push_str(text);
    }
}

fn parse_matrix_html(html: &str) -> ParsedHtml {
    let fragment = Html::parse_fragment(html);
    let mut parsed = ParsedHtml::default();
    walk(&mut parsed, fragment.tree.root());
    while parsed.text.ends_with('\n') {
        parsed.text.pop();
    }
    parsed
}

fn collect_text(node: ego_tree::NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    for child in node.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&text),
            Node::Element(_) => out.push_str(&collect_text(child)),
            _ => {}
        }
    }
    out
}

fn walk(parsed: &mut ParsedHtml, node: ego_tree::NodeRef<'_, Node>) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => parsed.push(&text),
            Node::Element(element) => match element.name() {
                "br" => parsed.push("\n"),
                // Reply fallbacks are stripped; the body repeats the text.
                "mx-reply" => {}
                "a" => {
                    let href = element.attr("href").unwrap_or_default();
                    let anchor_text = collect_text(child);
                    if let Some(target) = href.strip_prefix(MATRIX_TO_PREFIX) {
                        let target = target.split(&['?', '#'][..]).next().unwrap_or(target);
                        if target.starts_with('@') {
                            parsed.mentions.push(MentionEntity {
                                offset: parsed.char_len(),
                                length: anchor_text.chars().count(),
                                user_id: target.to_owned(),
                            });
                            parsed.push(&anchor_text);
                            continue;
                        }
                    }
                    parsed.push(&anchor_text);
                    if !href.is_empty() && href != anchor_text {
                        parsed.push(&format!(" ({href})"));
                    }
                }
                "code" => {
                    parsed.push("`");
                    walk(parsed, child);
                    parsed.push("`");
                }
                "pre" => {
                    parsed.push("```\n");
                    walk(parsed, child);
                    if !parsed.text.ends_with('\n') {
                        parsed.push("\n");
                    }
                    parsed.push("```");
                }
                "blockquote" => {
                    parsed.push("> ");
                    walk(parsed, child);
                    parsed.push("\n");
                }
                "li" => {
                    parsed.push("- ");
                    walk(parsed, child);
                    parsed.push("\n");
                }
                "p" | "div" => {
                    walk(parsed, child);
                    parsed.push("\n");
                }
                _ => walk(parsed, child),
            },
            _ => {}
        }
    }
}

/// Translate Matrix message content into a LinkedIn `MessageCreate`.
///
/// Emotes are rewritten as `* {displayname} {text}` with a self-mention
/// attribute covering the displayname at offset 2.
pub async fn matrix_to_linkedin(
    bridge: &Arc<Bridge>,
    content: &MessageContent,
    sender: &User,
) -> Result<MessageCreate> {
    let sender_urn = sender
        .li_member_urn()
        .await
        .context("sender has no LinkedIn member URN")?;

    let (mut text, entities) =
        if content.format.as_deref() == Some(FORMAT_HTML) && content.formatted_body.is_some() {
            let parsed = parse_matrix_html(content.formatted_body.as_deref().unwrap_or_default());
            (parsed.text, parsed.mentions)
        } else {
            (content.body.clone(), Vec::new())
        };

    let mut attributes = Vec::new();
    let mut shift = 0usize;

    if content.msgtype == MSGTYPE_EMOTE {
        match bridge.appservice.bot_intent().get_displayname(&sender.mxid).await {
            Ok(Some(displayname)) if !displayname.is_empty() => {
                let displayname_len = displayname.chars().count();
                text = format!("* {displayname} {text}");
                shift = 2 + displayname_len + 1;
                attributes.push(Attribute::mention(2, displayname_len, sender_urn.clone()));
            }
            Ok(_) | Err(_) => {
                warn!("Couldn't find displayname for {}", sender.mxid);
            }
        }
    }

    for entity in entities {
        let Some(urn) = resolve_member_urn(bridge, &entity.user_id).await else {
            continue;
        };
        attributes.push(Attribute::mention(entity.offset + shift, entity.length, urn));
    }

    Ok(MessageCreate {
        attributed_body: Some(AttributedBody { text: text.clone(), attributes }),
        body: text,
        attachments: Vec::new(),
    })
}

async fn resolve_member_urn(bridge: &Arc<Bridge>, mxid: &str) -> Option<lima_linkedin::Urn> {
    if let Ok(Some(user)) = bridge.get_user_by_mxid(mxid, false).await {
        if let Some(urn) = user.li_member_urn().await {
            return Some(urn);
        }
    }
    if let Ok(Some(puppet)) = bridge.get_puppet_by_mxid(mxid, false).await {
        return Some(puppet.li_member_urn.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let parsed = parse_matrix_html("hello world");
        assert_eq!(parsed.text, "hello world");
        assert!(parsed.mentions.is_empty());
    }

    #[test]
    fn br_becomes_newline() {
        let parsed = parse_matrix_html("line one<br/>line two");
        assert_eq!(parsed.text, "line one\nline two");
    }

    #[test]
    fn mention_anchor_yields_entity_with_char_offsets() {
        let parsed = parse_matrix_html(
            "Hey <a href=\"https://matrix.to/#/@linkedin_X:h\">@X</a>, hello",
        );
        assert_eq!(parsed.text, "Hey @X, hello");
        assert_eq!(parsed.mentions.len(), 1);
        assert_eq!(parsed.mentions[0].offset, 4);
        assert_eq!(parsed.mentions[0].length, 2);
        assert_eq!(parsed.mentions[0].user_id, "@linkedin_X:h");
    }

    #[test]
    fn mention_offsets_count_scalars_not_bytes() {
        let parsed = parse_matrix_html(
            "héé <a href=\"https://matrix.to/#/@u:h\">@U</a>",
        );
        assert_eq!(parsed.mentions[0].offset, 4);
    }

    #[test]
    fn room_links_are_not_mentions() {
        let parsed = parse_matrix_html(
            "see <a href=\"https://matrix.to/#/#room:h\">the room</a>",
        );
        assert!(parsed.mentions.is_empty());
        assert_eq!(parsed.text, "see the room");
    }

    #[test]
    fn external_link_keeps_url_when_text_differs() {
        let parsed = parse_matrix_html("<a href=\"https://example.com\">docs</a>");
        assert_eq!(parsed.text, "docs (https://example.com)");
    }

    #[test]
    fn entities_are_decoded_by_the_parser() {
        let parsed = parse_matrix_html("a &amp; b &lt;c&gt;");
        assert_eq!(parsed.text, "a & b <c>");
    }

    #[test]
    fn reply_fallback_is_stripped() {
        let parsed = parse_matrix_html(
            "<mx-reply><blockquote>old</blockquote></mx-reply>actual reply",
        );
        assert_eq!(parsed.text, "actual reply");
    }

    #[test]
    fn code_and_pre_render_as_markdown() {
        assert_eq!(parse_matrix_html("run <code>ls</code>").text, "run `ls`");
        assert_eq!(parse_matrix_html("<pre>a\nb</pre>").text, "```\na\nb\n```");
    }
}
