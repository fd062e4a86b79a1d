//! Azure Blob XML bodies.
//!
//! Azure reports failures as an `<Error>` document and takes the block
//! list of a streamed upload as a `<BlockList>` document. Both are
//! handled here with `quick-xml`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

// ── Error response ──────────────────────────────────────────────────

/// Code and message from an Azure error body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AzureErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Parse an Azure `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <Error>
///   <Code>ContainerAlreadyExists</Code>
///   <Message>The specified container already exists.</Message>
/// </Error>
/// ```
///
/// Unknown elements are ignored; malformed input yields whatever was read
/// before the error.
pub fn parse_error(body: &str) -> AzureErrorBody {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut out = AzureErrorBody::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => current = Some(e.name().as_ref().to_vec()),
            Ok(Event::Text(t)) => {
                let Ok(text) = t.unescape() else { break };
                match current.as_deref() {
                    Some(b"Code") => out.code = Some(text.into_owned()),
                    Some(b"Message") => out.message = Some(text.into_owned()),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    out
}

// ── Block list ──────────────────────────────────────────────────────

/// Render the `<BlockList>` body for Put Block List.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <BlockList>
///   <Latest>AAAA</Latest>
/// </BlockList>
/// ```
pub fn render_block_list(block_ids: &[String]) -> anyhow::Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("BlockList")))?;
    for id in block_ids {
        write_text_element(&mut writer, "Latest", id)?;
    }
    writer.write_event(Event::End(BytesEnd::new("BlockList")))?;

    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_body() {
        let body = "\u{feff}<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>ContainerAlreadyExists</Code><Message>The specified container already exists.\nRequestId:abc</Message></Error>";
        let parsed = parse_error(body.trim_start_matches('\u{feff}'));
        assert_eq!(parsed.code.as_deref(), Some("ContainerAlreadyExists"));
        assert!(parsed
            .message
            .as_deref()
            .unwrap()
            .starts_with("The specified container already exists."));
    }

    #[test]
    fn test_parse_error_ignores_extra_elements() {
        let body = "<Error><Code>AuthenticationFailed</Code><AuthenticationErrorDetail>sig</AuthenticationErrorDetail></Error>";
        let parsed = parse_error(body);
        assert_eq!(parsed.code.as_deref(), Some("AuthenticationFailed"));
        assert_eq!(parsed.message, None);
    }

    #[test]
    fn test_parse_error_empty_and_garbage() {
        assert_eq!(parse_error(""), AzureErrorBody::default());
        assert_eq!(parse_error("not xml at all").code, None);
    }

    #[test]
    fn test_render_block_list() {
        let xml = render_block_list(&["QUFB".to_string(), "QkJC".to_string()]).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<BlockList><Latest>QUFB</Latest><Latest>QkJC</Latest></BlockList>"));
    }

    #[test]
    fn test_render_block_list_escapes() {
        let xml = render_block_list(&["a+b/c=".to_string()]).unwrap();
        assert!(xml.contains("<Latest>a+b/c=</Latest>"));
    }
}
