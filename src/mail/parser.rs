use anyhow::{Context, Result};
use mail_parser::{Address, MessageParser, MimeHeaders, PartType};

use super::types::{AttachmentMeta, MessageFlags, ParsedMessage};

/// Parse a raw RFC822 message into its canonical record plus the attachment
/// payloads, index-aligned with `ParsedMessage::attachments`.
pub fn parse_message(
    uid: u32,
    raw: &[u8],
    flags: MessageFlags,
    size: u32,
) -> Result<(ParsedMessage, Vec<Vec<u8>>)> {
    let message = MessageParser::default()
        .parse(raw)
        .context("unparseable MIME structure")?;

    let from_addr = format_address_list(message.from()).unwrap_or_default();
    let to_addr = format_address_list(message.to());
    let cc_addr = format_address_list(message.cc());

    let subject = message.subject().map(|s| s.to_string()).unwrap_or_default();
    let date = message.date().map(|d| d.to_timestamp()).unwrap_or(0);
    let message_id = message.message_id().map(|s| s.to_string());

    let body_text = extract_text_body(&message);
    let body_html = extract_html_body(&message);

    let in_reply_to = message
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| s.to_string()));

    let references: Vec<String> = message
        .references()
        .as_text_list()
        .map(|ids| ids.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();

    let mut attachments = Vec::new();
    let mut payloads = Vec::new();
    for part in message.attachments() {
        let filename = part
            .attachment_name()
            .unwrap_or("attachment")
            .to_string();
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let contents = part.contents();
        attachments.push(AttachmentMeta {
            filename,
            content_type,
            size: contents.len() as i64,
            path: None,
        });
        payloads.push(contents.to_vec());
    }

    let parsed = ParsedMessage {
        uid,
        message_id,
        subject,
        from_addr,
        to_addr,
        cc_addr,
        date,
        flags,
        size,
        body_text,
        body_html,
        in_reply_to,
        references,
        eml_path: None,
        attachments,
    };

    Ok((parsed, payloads))
}

/// Format a structured address list as `Name <addr>` entries joined by `", "`.
/// An address without a display name is emitted bare.
pub fn format_address_list(address: Option<&Address<'_>>) -> Option<String> {
    let address = address?;
    let formatted: Vec<String> = address
        .iter()
        .filter_map(|addr| {
            let email = addr.address()?;
            Some(match addr.name() {
                Some(name) if !name.trim().is_empty() => {
                    format!("{} <{}>", name.trim(), email)
                }
                _ => email.to_string(),
            })
        })
        .collect();

    if formatted.is_empty() {
        None
    } else {
        Some(formatted.join(", "))
    }
}

fn extract_text_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    // Fallback: first text part of any subtype
    for part in message.parts.iter() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    None
}

fn extract_html_body(message: &mail_parser::Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }

    None
}

pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> MessageFlags {
    let mut result = MessageFlags::empty();

    for flag in flags {
        match flag {
            async_imap::types::Flag::Seen => result |= MessageFlags::SEEN,
            async_imap::types::Flag::Answered => result |= MessageFlags::ANSWERED,
            async_imap::types::Flag::Flagged => result |= MessageFlags::FLAGGED,
            async_imap::types::Flag::Deleted => result |= MessageFlags::DELETED,
            async_imap::types::Flag::Draft => result |= MessageFlags::DRAFT,
            _ => {}
        }
    }

    result
}
