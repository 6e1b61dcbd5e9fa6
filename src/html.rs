//! Serialize DOM trees returned by the browser's `DOM.getDocument` into
//! static HTML.
//!
//! Snapshots are taken while scripts are enabled, so `<script>` and
//! `<noscript>` elements and inline event handler attributes are removed to
//! keep the result inert.

use serde_json::Value;

/// HTML event handler content attributes, removed from snapshots.
pub const EVENT_ATTRIBUTES: &[&str] = &[
    "onabort", "onafterprint", "onauxclick", "onbeforeprint", "onbeforeunload",
    "onblur", "oncancel", "oncanplay", "oncanplaythrough", "onchange", "onclick",
    "onclose", "oncontextmenu", "oncopy", "oncuechange", "oncut", "ondblclick",
    "ondrag", "ondragend", "ondragenter", "ondragexit", "ondragleave",
    "ondragover", "ondragstart", "ondrop", "ondurationchange", "onemptied",
    "onended", "onerror", "onfocus", "onformdata", "onhashchange", "oninput",
    "oninvalid", "onkeydown", "onkeypress", "onkeyup", "onlanguagechange",
    "onload", "onloadeddata", "onloadedmetadata", "onloadend", "onloadstart",
    "onmessage", "onmessageerror", "onmousedown", "onmouseenter", "onmouseleave",
    "onmousemove", "onmouseout", "onmouseover", "onmouseup", "onoffline",
    "ononline", "onpagehide", "onpageshow", "onpaste", "onpause", "onplay",
    "onplaying", "onpopstate", "onprogress", "onratechange", "onrejectionhandled",
    "onreset", "onresize", "onscroll", "onsecuritypolicyviolation", "onseeked",
    "onseeking", "onselect", "onslotchange", "onstalled", "onstorage", "onsubmit",
    "onsuspend", "ontimeupdate", "ontoggle", "onunhandledrejection", "onunload",
    "onvolumechange", "onwaiting", "onwheel",
];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "param", "source", "track", "wbr",
];

/// Elements whose text content must be emitted verbatim.
const RAW_TEXT_ELEMENTS: &[&str] = &["style", "xmp", "noembed", "noframes", "plaintext"];

const NODE_ELEMENT: i64 = 1;
const NODE_TEXT: i64 = 3;
const NODE_COMMENT: i64 = 8;
const NODE_DOCUMENT: i64 = 9;
const NODE_DOCTYPE: i64 = 10;
const NODE_FRAGMENT: i64 = 11;

/// Split a pierced `DOM.getDocument` tree into its independent documents.
///
/// Yields the root document first, then every nested `contentDocument`
/// (iframes), in tree order.
pub fn split_documents(root: &Value) -> Vec<&Value> {
    let mut documents = Vec::new();
    collect_documents(root, &mut documents);
    documents
}

fn collect_documents<'a>(node: &'a Value, documents: &mut Vec<&'a Value>) {
    if node["nodeType"].as_i64() == Some(NODE_DOCUMENT) {
        documents.push(node);
    }
    if let Some(children) = node["children"].as_array() {
        for child in children {
            collect_documents(child, documents);
        }
    }
    if let Some(content) = node.get("contentDocument") {
        collect_documents(content, documents);
    }
}

/// Render a document node to HTML, dropping `strip_tags` subtrees and all
/// event handler attributes.
pub fn serialize(node: &Value, strip_tags: &[&str]) -> String {
    let mut out = String::new();
    render(node, strip_tags, false, &mut out);
    out
}

fn render(node: &Value, strip_tags: &[&str], raw_text: bool, out: &mut String) {
    match node["nodeType"].as_i64() {
        Some(NODE_DOCUMENT) | Some(NODE_FRAGMENT) => {
            if let Some(children) = node["children"].as_array() {
                for child in children {
                    render(child, strip_tags, raw_text, out);
                }
            }
        }
        Some(NODE_DOCTYPE) => {
            let name = node["nodeName"].as_str().unwrap_or("html");
            out.push_str("<!DOCTYPE ");
            out.push_str(name);
            out.push('>');
        }
        Some(NODE_ELEMENT) => {
            let name = node["nodeName"].as_str().unwrap_or("").to_ascii_lowercase();
            if strip_tags.iter().any(|t| *t == name) {
                return;
            }
            out.push('<');
            out.push_str(&name);
            if let Some(attributes) = node["attributes"].as_array() {
                for pair in attributes.chunks(2) {
                    let attr = pair[0].as_str().unwrap_or("");
                    if EVENT_ATTRIBUTES.iter().any(|e| attr.eq_ignore_ascii_case(e)) {
                        continue;
                    }
                    let value = pair.get(1).and_then(Value::as_str).unwrap_or("");
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&name.as_str()) {
                return;
            }
            // the content document of an iframe is serialized separately
            if node.get("contentDocument").is_none() {
                let raw = RAW_TEXT_ELEMENTS.contains(&name.as_str());
                if let Some(children) = node["children"].as_array() {
                    for child in children {
                        render(child, strip_tags, raw, out);
                    }
                }
            }
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        }
        Some(NODE_TEXT) => {
            let text = node["nodeValue"].as_str().unwrap_or("");
            if raw_text {
                out.push_str(text);
            } else {
                out.push_str(&html_escape::encode_text(text));
            }
        }
        Some(NODE_COMMENT) => {
            out.push_str("<!--");
            out.push_str(node["nodeValue"].as_str().unwrap_or(""));
            out.push_str("-->");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(name: &str, attributes: Value, children: Value) -> Value {
        json!({
            "nodeType": NODE_ELEMENT,
            "nodeName": name,
            "attributes": attributes,
            "children": children,
        })
    }

    fn text(value: &str) -> Value {
        json!({"nodeType": NODE_TEXT, "nodeValue": value})
    }

    #[test]
    fn test_serialize_basic_document() {
        let doc = json!({
            "nodeType": NODE_DOCUMENT,
            "nodeName": "#document",
            "documentURL": "http://example.com/",
            "children": [
                {"nodeType": NODE_DOCTYPE, "nodeName": "html"},
                element("HTML", json!([]), json!([
                    element("BODY", json!([]), json!([
                        element("P", json!(["class", "x"]), json!([text("hi & bye")])),
                    ])),
                ])),
            ],
        });
        assert_eq!(
            serialize(&doc, &[]),
            "<!DOCTYPE html><html><body><p class=\"x\">hi &amp; bye</p></body></html>"
        );
    }

    #[test]
    fn test_strip_script_and_noscript_subtrees() {
        let doc = json!({
            "nodeType": NODE_DOCUMENT,
            "nodeName": "#document",
            "children": [
                element("BODY", json!([]), json!([
                    element("SCRIPT", json!([]), json!([text("while(true){}")])),
                    element("NOSCRIPT", json!([]), json!([element("IMG", json!(["src", "x.png"]), json!([]))])),
                    element("P", json!([]), json!([text("kept")])),
                ])),
            ],
        });
        assert_eq!(
            serialize(&doc, &["script", "noscript"]),
            "<body><p>kept</p></body>"
        );
    }

    #[test]
    fn test_strip_event_attributes() {
        let doc = element(
            "BUTTON",
            json!(["onclick", "evil()", "OnMouseOver", "evil()", "title", "ok"]),
            json!([text("go")]),
        );
        assert_eq!(serialize(&doc, &[]), "<button title=\"ok\">go</button>");
    }

    #[test]
    fn test_void_elements_and_attribute_escaping() {
        let doc = element("IMG", json!(["src", "a.png", "alt", "\"quoted\""]), json!([]));
        assert_eq!(serialize(&doc, &[]), "<img src=\"a.png\" alt=\"&quot;quoted&quot;\">");
    }

    #[test]
    fn test_style_text_not_escaped() {
        let doc = element("STYLE", json!([]), json!([text("a > b { color: red }")]));
        assert_eq!(serialize(&doc, &[]), "<style>a > b { color: red }</style>");
    }

    #[test]
    fn test_split_documents_at_iframe_boundaries() {
        let inner = json!({
            "nodeType": NODE_DOCUMENT,
            "nodeName": "#document",
            "documentURL": "http://frames.example/inner",
            "children": [element("HTML", json!([]), json!([]))],
        });
        let doc = json!({
            "nodeType": NODE_DOCUMENT,
            "nodeName": "#document",
            "documentURL": "http://example.com/",
            "children": [
                element("HTML", json!([]), json!([{
                    "nodeType": NODE_ELEMENT,
                    "nodeName": "IFRAME",
                    "attributes": ["src", "http://frames.example/inner"],
                    "children": [],
                    "contentDocument": inner,
                }])),
            ],
        });
        let documents = split_documents(&doc);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["documentURL"], "http://example.com/");
        assert_eq!(documents[1]["documentURL"], "http://frames.example/inner");
        // the iframe's content is not inlined into the outer document
        assert_eq!(
            serialize(&doc, &[]),
            "<html><iframe src=\"http://frames.example/inner\"></iframe></html>"
        );
    }
}
