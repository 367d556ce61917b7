//! JSON content type.
//!
//! In-band frames are `[header,\tbody]\t`. A message without body is
//! framed as `[header,\t{}]\t`.

use bytes::{BufMut, Bytes, BytesMut};
use entity_bus_core::Header;
use serde_json::Value;

use crate::{
    format::{CONTENT_TYPE_JSON, Format, FormatError},
    messages::StructValue,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormat;

fn body_value(body: Option<&StructValue>) -> Value {
    body.map_or_else(|| Value::Object(serde_json::Map::new()), |b| b.body().clone())
}

impl Format for JsonFormat {
    fn content_type(&self) -> i32 {
        CONTENT_TYPE_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, header: &Header, body: Option<&StructValue>) -> Result<Bytes, FormatError> {
        let mut buf = BytesMut::with_capacity(256).writer();
        buf.get_mut().put_u8(b'[');
        serde_json::to_writer(&mut buf, header)?;
        buf.get_mut().put_slice(b",\t");
        serde_json::to_writer(&mut buf, &body_value(body))?;
        buf.get_mut().put_slice(b"]\t");
        Ok(buf.into_inner().freeze())
    }

    fn serialize_data(&self, body: Option<&StructValue>) -> Result<Bytes, FormatError> {
        Ok(Bytes::from(serde_json::to_vec(&body_value(body))?))
    }

    fn parse(&self, payload: &[u8]) -> Result<(Header, Option<StructValue>), FormatError> {
        let (header, body): (Header, Value) = serde_json::from_slice(payload)?;
        let body = (!header.type_name.is_empty())
            .then(|| StructValue::new(header.type_name.clone(), body));
        Ok((header, body))
    }

    fn parse_data(&self, payload: &[u8], type_name: &str) -> Result<Option<StructValue>, FormatError> {
        if type_name.is_empty() {
            return Ok(None);
        }
        let body = if payload.iter().all(u8::is_ascii_whitespace) {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_slice(payload)?
        };
        Ok(Some(StructValue::new(type_name, body)))
    }
}

#[cfg(test)]
mod tests {
    use entity_bus_core::{MsgMode, Status};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_frame_layout() {
        let header = Header {
            destname: "server".into(),
            srcid: 1,
            type_name: "Echo".into(),
            corrid: 2,
            ..Header::default()
        };
        let body = StructValue::new("Echo", json!({ "text": "hi" }));
        let frame = JsonFormat.serialize(&header, Some(&body)).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("[{"));
        assert!(text.ends_with(",\t{\"text\":\"hi\"}]\t"));

        let (parsed, body) = JsonFormat.parse(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body.unwrap().body()["text"], "hi");
    }

    #[test]
    fn test_status_only_reply_has_no_body() {
        let header = Header::reply(1, 2, Status::RequestNotFound, "", 3);
        let frame = JsonFormat.serialize(&header, None).unwrap();
        assert!(frame.ends_with(b",\t{}]\t"));
        let (parsed, body) = JsonFormat.parse(&frame).unwrap();
        assert_eq!(parsed.mode, MsgMode::Reply);
        assert_eq!(parsed.status, Status::RequestNotFound);
        assert!(body.is_none());
    }

    #[test]
    fn test_garbage_is_a_syntax_error() {
        assert!(JsonFormat.parse(b"[{\"destid\":").is_err());
        assert!(JsonFormat.parse(b"{}").is_err());
    }

    #[test]
    fn test_parse_data() {
        assert!(JsonFormat.parse_data(b"{}", "").unwrap().is_none());
        let body = JsonFormat.parse_data(b"", "Ping").unwrap().unwrap();
        assert_eq!(body.type_name(), "Ping");
        assert!(JsonFormat.parse_data(b"{", "Ping").is_err());
    }
}
