// ── XML-RPC codec ──
//
// Hand-rolled encoder and a small tree-based decoder. The CCU dialect is
// a strict subset of XML-RPC (scalars, base64, array, struct), so a full
// DOM library would be overkill; quick-xml's pull parser plus a tiny node
// tree covers everything the interface processes emit.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::Error;
use crate::value::Value;

// ── Encoding ──

/// Serialize a methodCall document.
pub fn encode_request(method: &str, params: &[Value]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    out.push_str("<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for p in params {
        out.push_str("<param>");
        encode_value(p, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Serialize a successful methodResponse.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    out.push_str("<methodResponse><params><param>");
    encode_value(value, &mut out);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Serialize a fault methodResponse.
pub fn encode_fault(code: i64, message: &str) -> String {
    let fault = Value::Struct(BTreeMap::from([
        ("faultCode".to_owned(), Value::Int(code)),
        ("faultString".to_owned(), Value::String(message.to_owned())),
    ]));
    let mut out = String::with_capacity(192);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    out.push_str("<methodResponse><fault>");
    encode_value(&fault, &mut out);
    out.push_str("</fault></methodResponse>");
    out
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Bool(b) => {
            out.push_str("<boolean>");
            out.push(if *b { '1' } else { '0' });
            out.push_str("</boolean>");
        }
        Value::Int(i) => {
            out.push_str("<i4>");
            out.push_str(&i.to_string());
            out.push_str("</i4>");
        }
        Value::Double(d) => {
            out.push_str("<double>");
            out.push_str(&format_double(*d));
            out.push_str("</double>");
        }
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Binary(b) => {
            out.push_str("<base64>");
            out.push_str(&BASE64.encode(b));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                encode_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// The interface processes refuse a FLOAT write tagged without a decimal
/// point, so whole doubles are written as "1.0" rather than "1".
fn format_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{d:.1}")
    } else {
        format!("{d}")
    }
}

// ── Decoding ──

/// Parse a methodResponse, mapping `<fault>` documents to [`Error::Fault`].
pub fn decode_response(xml: &str) -> Result<Value, Error> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(Error::codec(format!("expected methodResponse, got <{}>", root.name)));
    }
    let body = root
        .children
        .first()
        .ok_or_else(|| Error::codec("empty methodResponse"))?;
    match body.name.as_str() {
        "params" => {
            // An empty <params/> is how the CCU answers void methods.
            match body.children.first() {
                Some(param) => decode_value(param.child("value")?),
                None => Ok(Value::empty()),
            }
        }
        "fault" => {
            let detail = decode_value(body.child("value")?)?;
            let code = detail.get("faultCode").and_then(Value::as_i64).unwrap_or(-1);
            let message = detail
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or("unknown fault")
                .to_owned();
            Err(Error::Fault { code, message })
        }
        other => Err(Error::codec(format!("unexpected <{other}> in methodResponse"))),
    }
}

/// Parse an inbound methodCall into its method name and parameter list.
pub fn decode_request(xml: &str) -> Result<(String, Vec<Value>), Error> {
    let root = parse_tree(xml)?;
    if root.name != "methodCall" {
        return Err(Error::codec(format!("expected methodCall, got <{}>", root.name)));
    }
    let method = root.child("methodName")?.text.trim().to_owned();
    let mut params = Vec::new();
    if let Some(list) = root.children.iter().find(|c| c.name == "params") {
        for param in &list.children {
            params.push(decode_value(param.child("value")?)?);
        }
    }
    Ok((method, params))
}

fn decode_value(node: &Node) -> Result<Value, Error> {
    let Some(typed) = node.children.first() else {
        // Untyped <value>text</value> is a string per the XML-RPC spec.
        return Ok(Value::String(node.text.clone()));
    };
    match typed.name.as_str() {
        "boolean" => match typed.text.trim() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" | "" => Ok(Value::Bool(false)),
            other => Err(Error::codec(format!("invalid boolean: {other}"))),
        },
        "i4" | "int" | "i8" => typed
            .text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|e| Error::codec(format!("invalid integer: {e}"))),
        "double" => typed
            .text
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| Error::codec(format!("invalid double: {e}"))),
        "string" | "dateTime.iso8601" => Ok(Value::String(typed.text.clone())),
        "base64" => {
            let cleaned: String = typed.text.chars().filter(|c| !c.is_whitespace()).collect();
            BASE64
                .decode(cleaned)
                .map(Value::Binary)
                .map_err(|e| Error::codec(format!("invalid base64: {e}")))
        }
        "array" => {
            let data = typed.child("data")?;
            let mut items = Vec::with_capacity(data.children.len());
            for item in &data.children {
                items.push(decode_value(item)?);
            }
            Ok(Value::Array(items))
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in &typed.children {
                if member.name != "member" {
                    continue;
                }
                let name = member.child("name")?.text.trim().to_owned();
                let value = decode_value(member.child("value")?)?;
                members.insert(name, value);
            }
            Ok(Value::Struct(members))
        }
        other => Err(Error::codec(format!("unknown value type <{other}>"))),
    }
}

// ── Node tree ──

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn named(name: String) -> Self {
        Node { name, ..Node::default() }
    }

    fn child(&self, name: &str) -> Result<&Node, Error> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::codec(format!("missing <{name}> inside <{}>", self.name)))
    }
}

/// Build a node tree from the document. Whitespace-only text between
/// elements is dropped; text inside leaf elements is kept verbatim.
fn parse_tree(xml: &str) -> Result<Node, Error> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = vec![Node::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(Node::named(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::named(name));
                }
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::codec("unbalanced close tag"))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| Error::codec("close tag at document root"))?;
                parent.children.push(node);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::codec(format!("bad text node: {e}")))?;
                if let Some(node) = stack.last_mut() {
                    if node.children.is_empty() {
                        node.text.push_str(&text);
                    } else if !text.trim().is_empty() {
                        return Err(Error::codec("mixed content is not valid here"));
                    }
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::codec(format!("xml parse error: {e}"))),
        }
    }
    let root = stack.pop().ok_or_else(|| Error::codec("empty document"))?;
    if !stack.is_empty() {
        return Err(Error::codec("unclosed element at end of document"));
    }
    root.children
        .into_iter()
        .next()
        .ok_or_else(|| Error::codec("document has no root element"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_round_trip() {
        let params = vec![
            Value::String("BidCos-RF".into()),
            Value::Struct(BTreeMap::from([
                ("LEVEL".to_owned(), Value::Double(0.5)),
                ("STOP".to_owned(), Value::Bool(true)),
            ])),
            Value::Array(vec![Value::Int(1), Value::Int(-7)]),
        ];
        let xml = encode_request("setValue", &params);
        let (method, decoded) = decode_request(&xml).expect("decode");
        assert_eq!(method, "setValue");
        assert_eq!(decoded, params);
    }

    #[test]
    fn response_round_trip() {
        let value = Value::Struct(BTreeMap::from([
            ("ADDRESS".to_owned(), Value::String("NEQ1234567:1".into())),
            ("VALUE".to_owned(), Value::Double(21.5)),
        ]));
        let xml = encode_response(&value);
        assert_eq!(decode_response(&xml).expect("decode"), value);
    }

    #[test]
    fn fault_maps_to_error() {
        let xml = encode_fault(-1, "Failure");
        let err = decode_response(&xml).expect_err("fault");
        match err {
            Error::Fault { code, message } => {
                assert_eq!(code, -1);
                assert_eq!(message, "Failure");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn untyped_value_is_string() {
        let xml = "<methodResponse><params><param><value>plain</value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).expect("decode"), Value::String("plain".into()));
    }

    #[test]
    fn empty_params_is_empty_string() {
        let xml = "<methodResponse><params/></methodResponse>";
        assert_eq!(decode_response(xml).expect("decode"), Value::empty());
    }

    #[test]
    fn whole_doubles_keep_a_decimal_point() {
        let xml = encode_response(&Value::Double(1.0));
        assert!(xml.contains("<double>1.0</double>"), "{xml}");
    }

    #[test]
    fn escaped_text_survives() {
        let value = Value::String("a<b & \"c\"".into());
        let xml = encode_response(&value);
        assert_eq!(decode_response(&xml).expect("decode"), value);
    }

    #[test]
    fn base64_round_trip() {
        let value = Value::Binary(vec![0, 1, 2, 250]);
        let xml = encode_response(&value);
        assert_eq!(decode_response(&xml).expect("decode"), value);
    }

    #[test]
    fn request_without_params_decodes() {
        let xml = "<methodCall><methodName>system.listMethods</methodName></methodCall>";
        let (method, params) = decode_request(xml).expect("decode");
        assert_eq!(method, "system.listMethods");
        assert!(params.is_empty());
    }
}
