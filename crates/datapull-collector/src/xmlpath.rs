//! Path expressions over XML documents.
//!
//! Supports the subset the extraction rules need: absolute and relative
//! child steps, `//` descendant steps, `*` wildcards and `[@attr='value']`
//! predicates. Matched elements are materialized into an owned
//! [`ElementNode`] tree so label templates can keep navigating after the
//! parsed document is gone.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::{Object, Value};
use minijinja::{Error as TemplateError, ErrorKind, State};

use crate::error::{CollectorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    name: String,
    predicate: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    HasAttr(String),
    AttrEquals(String, String),
}

/// A compiled XML path.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlPath {
    steps: Vec<Step>,
    original: String,
}

impl XmlPath {
    /// Parse a path expression.
    pub fn parse(path: &str) -> Result<Self> {
        let bad = |msg: &str| CollectorError::InvalidXmlPath(path.to_string(), msg.to_string());
        if path.trim().is_empty() {
            return Err(bad("empty path"));
        }

        let mut rest = path.trim();
        let mut steps = Vec::new();
        let mut axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            Axis::Child
        } else {
            Axis::Child
        };

        for segment in rest.split('/') {
            if segment.is_empty() {
                // "a//b": an empty segment switches the next step to
                // descendant traversal.
                axis = Axis::Descendant;
                continue;
            }
            let (name, predicate) = parse_segment(segment).ok_or_else(|| bad("bad segment"))?;
            steps.push(Step {
                axis,
                name,
                predicate,
            });
            axis = Axis::Child;
        }
        if steps.is_empty() {
            return Err(bad("no steps"));
        }
        Ok(Self {
            steps,
            original: path.to_string(),
        })
    }

    /// The path text as written in the configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Evaluate against a parsed document, materializing matches.
    #[must_use]
    pub fn find_in_document(&self, doc: &roxmltree::Document<'_>) -> Vec<Arc<ElementNode>> {
        let root = ElementNode::from_xml(doc.root_element());
        self.find(&root)
    }

    /// Evaluate relative to `context` (which counts as the subtree root).
    #[must_use]
    pub fn find(&self, context: &Arc<ElementNode>) -> Vec<Arc<ElementNode>> {
        let mut current = vec![context.clone()];
        for (i, step) in self.steps.iter().enumerate() {
            let mut next = Vec::new();
            for node in &current {
                match step.axis {
                    Axis::Child => {
                        for child in &node.children {
                            if step.matches(child) {
                                next.push(child.clone());
                            }
                        }
                    }
                    Axis::Descendant => {
                        // A leading descendant step may also match the
                        // context element itself.
                        if i == 0 && step.matches(node) {
                            next.push(node.clone());
                        }
                        node.walk(&mut |el| {
                            if step.matches(el) {
                                next.push(el.clone());
                            }
                        });
                    }
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }
}

impl Step {
    fn matches(&self, el: &Arc<ElementNode>) -> bool {
        if self.name != "*" && self.name != el.name {
            return false;
        }
        match &self.predicate {
            None => true,
            Some(Predicate::HasAttr(name)) => el.attrs.contains_key(name),
            Some(Predicate::AttrEquals(name, value)) => {
                el.attrs.get(name).is_some_and(|v| v == value)
            }
        }
    }
}

fn parse_segment(segment: &str) -> Option<(String, Option<Predicate>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment.to_string(), None));
    };
    let name = &segment[..open];
    let inner = segment[open..].strip_prefix('[')?.strip_suffix(']')?;
    let inner = inner.strip_prefix('@')?;
    if name.is_empty() {
        return None;
    }
    let predicate = match inner.split_once('=') {
        None => Predicate::HasAttr(inner.to_string()),
        Some((attr, value)) => {
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))?;
            Predicate::AttrEquals(attr.to_string(), value.to_string())
        }
    };
    Some((name.to_string(), Some(predicate)))
}

/// An owned element: tag name, attributes, leading text and children.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    /// Tag name without namespace prefix.
    pub name: String,
    /// Attribute name/value pairs.
    pub attrs: BTreeMap<String, String>,
    /// Text before the first child element, trimmed.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Arc<ElementNode>>,
}

impl ElementNode {
    /// Materialize a parsed element subtree.
    #[must_use]
    pub fn from_xml(node: roxmltree::Node<'_, '_>) -> Arc<Self> {
        let attrs = node
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect();
        let text = node.text().unwrap_or("").trim().to_string();
        let children = node
            .children()
            .filter(roxmltree::Node::is_element)
            .map(Self::from_xml)
            .collect();
        Arc::new(Self {
            name: node.tag_name().name().to_string(),
            attrs,
            text,
            children,
        })
    }

    fn walk(&self, visit: &mut impl FnMut(&Arc<ElementNode>)) {
        for child in &self.children {
            visit(child);
            child.walk(visit);
        }
    }
}

/// The template-facing view of an element.
///
/// Exposes `text` and `attrs` as attributes and a `find(path)` method
/// returning the first matching descendant, so label templates can read
/// siblings and nested values.
#[derive(Debug)]
pub struct ElementContext(pub Arc<ElementNode>);

impl Object for ElementContext {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "text" => Some(Value::from(self.0.text.clone())),
            "attrs" => Some(Value::from_serialize(&self.0.attrs)),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> std::result::Result<Value, TemplateError> {
        match method {
            "find" => {
                let [path] = args else {
                    return Err(TemplateError::new(
                        ErrorKind::InvalidOperation,
                        "find() takes one path argument",
                    ));
                };
                let path = path.as_str().ok_or_else(|| {
                    TemplateError::new(ErrorKind::InvalidOperation, "find() path must be a string")
                })?;
                let compiled = XmlPath::parse(path).map_err(|err| {
                    TemplateError::new(ErrorKind::InvalidOperation, err.to_string())
                })?;
                Ok(compiled
                    .find(&self.0)
                    .into_iter()
                    .next()
                    .map(|el| Value::from_object(ElementContext(el)))
                    .unwrap_or_default())
            }
            "attr" => {
                let value = args
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|name| self.0.attrs.get(name))
                    .cloned()
                    .unwrap_or_default();
                Ok(Value::from(value))
            }
            _ => Err(TemplateError::new(
                ErrorKind::UnknownMethod,
                format!("element has no method {method}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<root>
        <china dn="hour"><weather><city quName="吉林">16</city><city quName="辽宁">18</city></weather></china>
        <china dn="day"><weather><city quName="吉林">20</city></weather></china>
    </root>"#;

    #[test]
    fn test_descendant_with_predicate() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let path = XmlPath::parse("//china[@dn='hour']/weather/city").unwrap();
        let found = path.find_in_document(&doc);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].text, "16");
        assert_eq!(found[0].attrs.get("quName").unwrap(), "吉林");
    }

    #[test]
    fn test_absolute_child_path() {
        let doc = roxmltree::Document::parse("<a><b><c>x</c></b></a>").unwrap();
        let path = XmlPath::parse("/b/c").unwrap();
        let found = path.find_in_document(&doc);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "x");
    }

    #[test]
    fn test_wildcard_and_has_attr() {
        let doc =
            roxmltree::Document::parse(r#"<r><x id="1">a</x><y>b</y><z id="2">c</z></r>"#).unwrap();
        let path = XmlPath::parse("//*[@id]").unwrap();
        let found = path.find_in_document(&doc);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_relative_find_from_element() {
        let doc = roxmltree::Document::parse(
            "<measInfo><measTypes>a b c</measTypes><measResults>1 2 3</measResults></measInfo>",
        )
        .unwrap();
        let root = ElementNode::from_xml(doc.root_element());
        let path = XmlPath::parse("measResults").unwrap();
        let found = path.find(&root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "1 2 3");
    }

    #[test]
    fn test_bad_paths_rejected() {
        assert!(XmlPath::parse("").is_err());
        assert!(XmlPath::parse("a[foo]").is_err());
        assert!(XmlPath::parse("a[@k='v]").is_err());
    }

    #[test]
    fn test_element_context_in_template() {
        let doc = roxmltree::Document::parse(DOC).unwrap();
        let path = XmlPath::parse("//china[@dn='hour']/weather/city").unwrap();
        let el = path.find_in_document(&doc).remove(0);
        let tmpl = crate::template::Template::new("{{ attrs.quName }}:{{ text }}").unwrap();
        let ctx = minijinja::context! {
            text => el.text.clone(),
            attrs => el.attrs.clone(),
            el => Value::from_object(ElementContext(el)),
        };
        assert_eq!(tmpl.render(ctx).unwrap(), "吉林:16");
    }

    #[test]
    fn test_element_context_find_method() {
        let doc = roxmltree::Document::parse(
            "<measInfo><measTypes>a b</measTypes><measResults>1 2</measResults></measInfo>",
        )
        .unwrap();
        let el = ElementNode::from_xml(doc.root_element());
        let tmpl = crate::template::Template::new("{{ el.find('measResults').text }}").unwrap();
        let ctx = minijinja::context! { el => Value::from_object(ElementContext(el)) };
        assert_eq!(tmpl.render(ctx).unwrap(), "1 2");
    }
}
