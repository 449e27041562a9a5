//! Document template compilation and rendering.
//!
//! A template is a JSON object whose string leaves may contain
//! `{{ placeholder }}` tokens. Compilation happens once: it records which
//! placeholders are referenced and rejects names outside the closed set.
//! Rendering walks the compiled tree and only evaluates generators that the
//! template actually references.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{CbError, CbResult};
use crate::randomize::{self, BlockIncrementor, DateFormat, SimpleDate};

/// Every name a template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    First,
    Last,
    Address,
    City,
    State,
    Phone,
    ZipCode,
    Four,
    Account,
    Id,
    Ssn,
    CreditCard,
    Dollar,
    Hash,
    Year,
    Month,
    Day,
    Date1,
    Date2,
    Date3,
    Dob1,
    Dob2,
    Dob3,
    Bool,
    Email,
    Username,
    Nickname,
    Image,
    DateTime,
    Incrementor,
    BlockIncrementor,
}

const ALL: [(Placeholder, &str); 31] = [
    (Placeholder::First, "rand_first"),
    (Placeholder::Last, "rand_last"),
    (Placeholder::Address, "rand_address"),
    (Placeholder::City, "rand_city"),
    (Placeholder::State, "rand_state"),
    (Placeholder::Phone, "rand_phone"),
    (Placeholder::ZipCode, "rand_zip_code"),
    (Placeholder::Four, "rand_four"),
    (Placeholder::Account, "rand_account"),
    (Placeholder::Id, "rand_id"),
    (Placeholder::Ssn, "rand_ssn"),
    (Placeholder::CreditCard, "rand_credit_card"),
    (Placeholder::Dollar, "rand_dollar"),
    (Placeholder::Hash, "rand_hash"),
    (Placeholder::Year, "rand_year"),
    (Placeholder::Month, "rand_month"),
    (Placeholder::Day, "rand_day"),
    (Placeholder::Date1, "rand_date_1"),
    (Placeholder::Date2, "rand_date_2"),
    (Placeholder::Date3, "rand_date_3"),
    (Placeholder::Dob1, "rand_dob_1"),
    (Placeholder::Dob2, "rand_dob_2"),
    (Placeholder::Dob3, "rand_dob_3"),
    (Placeholder::Bool, "rand_bool"),
    (Placeholder::Email, "rand_email"),
    (Placeholder::Username, "rand_username"),
    (Placeholder::Nickname, "rand_nickname"),
    (Placeholder::Image, "rand_image"),
    (Placeholder::DateTime, "date_time"),
    (Placeholder::Incrementor, "incrementor"),
    (Placeholder::BlockIncrementor, "block_incrementor"),
];

impl Placeholder {
    pub fn name(&self) -> &'static str {
        ALL.iter()
            .find(|(p, _)| p == self)
            .map(|(_, n)| *n)
            .unwrap_or("unknown")
    }

    pub fn all() -> impl Iterator<Item = Placeholder> {
        ALL.iter().map(|(p, _)| *p)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Placeholder {
    type Err = CbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .find(|(_, n)| *n == s)
            .map(|(p, _)| *p)
            .ok_or_else(|| CbError::Template(format!("unknown placeholder '{}'", s)))
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static regex"))
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Field(Placeholder),
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Value),
    /// A string that is exactly one placeholder; renders the typed value
    Field(Placeholder),
    /// Placeholders spliced into surrounding text
    Splice(Vec<Segment>),
    Array(Vec<Node>),
    Object(Vec<(String, Node)>),
}

/// A compiled document template.
#[derive(Debug, Clone)]
pub struct DocTemplate {
    root: Vec<(String, Node)>,
    referenced: BTreeSet<Placeholder>,
    id_field: Option<String>,
    block_size: u64,
}

impl DocTemplate {
    /// Compile a JSON object template. Non-object templates and unknown
    /// placeholder names are rejected.
    pub fn compile(template: &Value) -> CbResult<Self> {
        let obj = template
            .as_object()
            .ok_or_else(|| CbError::Template("document template must be a JSON object".into()))?;
        let mut referenced = BTreeSet::new();
        let root = compile_object(obj, &mut referenced)?;
        Ok(Self {
            root,
            referenced,
            id_field: None,
            block_size: 1000,
        })
    }

    /// Field overwritten with the record number on every render.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    pub fn with_block_size(mut self, size: u64) -> Self {
        self.block_size = size.max(1);
        self
    }

    pub fn referenced(&self) -> &BTreeSet<Placeholder> {
        &self.referenced
    }

    pub fn references(&self, p: Placeholder) -> bool {
        self.referenced.contains(&p)
    }

    pub fn id_field(&self) -> Option<&str> {
        self.id_field.as_deref()
    }

    /// A renderer owns the per-holder block counter.
    pub fn renderer(&self) -> Renderer<'_> {
        Renderer {
            template: self,
            blocks: if self.references(Placeholder::BlockIncrementor) {
                Some(BlockIncrementor::new(self.block_size))
            } else {
                None
            },
        }
    }

    /// Render one document; `record` sets the id field when one is configured.
    pub fn render(&self, record: Option<u64>) -> Value {
        self.renderer().render(record)
    }
}

fn compile_object(obj: &Map<String, Value>, refs: &mut BTreeSet<Placeholder>) -> CbResult<Vec<(String, Node)>> {
    obj.iter()
        .map(|(k, v)| Ok((k.clone(), compile_value(v, refs)?)))
        .collect()
}

fn compile_value(v: &Value, refs: &mut BTreeSet<Placeholder>) -> CbResult<Node> {
    match v {
        Value::Object(m) => Ok(Node::Object(compile_object(m, refs)?)),
        Value::Array(items) => Ok(Node::Array(
            items.iter().map(|i| compile_value(i, refs)).collect::<CbResult<_>>()?,
        )),
        Value::String(s) => compile_string(s, refs),
        other => Ok(Node::Literal(other.clone())),
    }
}

fn compile_string(s: &str, refs: &mut BTreeSet<Placeholder>) -> CbResult<Node> {
    let re = token_regex();
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let whole = caps.get(0).expect("capture 0 always present");
        let p: Placeholder = caps[1].parse()?;
        refs.insert(p);
        if whole.start() > last {
            segments.push(Segment::Text(s[last..whole.start()].to_string()));
        }
        segments.push(Segment::Field(p));
        last = whole.end();
    }
    if segments.is_empty() {
        return Ok(Node::Literal(Value::String(s.to_string())));
    }
    if last < s.len() {
        segments.push(Segment::Text(s[last..].to_string()));
    }
    match segments.as_slice() {
        [Segment::Field(p)] => Ok(Node::Field(*p)),
        _ => Ok(Node::Splice(segments)),
    }
}

/// Per-document lazily computed values shared between related placeholders.
struct RecordContext<'r, R: Rng> {
    rng: &'r mut R,
    first: Option<String>,
    last: Option<String>,
    month: Option<u32>,
}

impl<'r, R: Rng> RecordContext<'r, R> {
    fn first(&mut self) -> String {
        if self.first.is_none() {
            self.first = Some(randomize::first_name(self.rng));
        }
        self.first.clone().unwrap_or_default()
    }

    fn last(&mut self) -> String {
        if self.last.is_none() {
            self.last = Some(randomize::last_name(self.rng));
        }
        self.last.clone().unwrap_or_default()
    }

    fn month(&mut self) -> u32 {
        *self.month.get_or_insert_with(|| randomize::month(self.rng))
    }

    fn date(&mut self, d: SimpleDate, fmt: DateFormat) -> Value {
        Value::String(d.format(fmt))
    }

    fn eval(&mut self, p: Placeholder, blocks: &mut Option<BlockIncrementor>) -> Value {
        match p {
            Placeholder::First => Value::String(self.first()),
            Placeholder::Last => Value::String(self.last()),
            Placeholder::Address => Value::String(randomize::address(self.rng)),
            Placeholder::City => Value::String(randomize::city(self.rng)),
            Placeholder::State => Value::String(randomize::state(self.rng)),
            Placeholder::Phone => Value::String(randomize::phone(self.rng)),
            Placeholder::ZipCode => Value::String(randomize::zip_code(self.rng)),
            Placeholder::Four => Value::String(randomize::four(self.rng)),
            Placeholder::Account => Value::String(randomize::account(self.rng)),
            Placeholder::Id => Value::String(randomize::id(self.rng)),
            Placeholder::Ssn => Value::String(randomize::ssn(self.rng)),
            Placeholder::CreditCard => Value::String(randomize::credit_card(self.rng)),
            Placeholder::Dollar => Value::String(randomize::dollar(self.rng)),
            Placeholder::Hash => Value::String(randomize::hash(self.rng)),
            Placeholder::Year => Value::from(randomize::year(self.rng)),
            Placeholder::Month => Value::String(format!("{:02}", self.month())),
            Placeholder::Day => {
                let m = self.month();
                Value::String(format!("{:02}", randomize::day(self.rng, m)))
            }
            Placeholder::Date1 => {
                let d = randomize::past_date(self.rng);
                self.date(d, DateFormat::Slash)
            }
            Placeholder::Date2 => {
                let d = randomize::past_date(self.rng);
                self.date(d, DateFormat::Dash)
            }
            Placeholder::Date3 => {
                let d = randomize::past_date(self.rng);
                self.date(d, DateFormat::Abbrev)
            }
            Placeholder::Dob1 => {
                let d = randomize::dob(self.rng);
                self.date(d, DateFormat::Slash)
            }
            Placeholder::Dob2 => {
                let d = randomize::dob(self.rng);
                self.date(d, DateFormat::Dash)
            }
            Placeholder::Dob3 => {
                let d = randomize::dob(self.rng);
                self.date(d, DateFormat::Abbrev)
            }
            Placeholder::Bool => Value::Bool(randomize::boolean(self.rng)),
            Placeholder::Email => {
                let (f, l) = (self.first(), self.last());
                Value::String(randomize::email(&f, &l))
            }
            Placeholder::Username => {
                let (f, l) = (self.first(), self.last());
                Value::String(randomize::username(self.rng, &f, &l))
            }
            Placeholder::Nickname => {
                let (f, l) = (self.first(), self.last());
                Value::String(randomize::nickname(&f, &l))
            }
            Placeholder::Image => Value::String(randomize::image(self.rng)),
            Placeholder::DateTime => Value::String(randomize::date_time()),
            Placeholder::Incrementor => Value::from(randomize::next_incrementor()),
            Placeholder::BlockIncrementor => match blocks {
                Some(b) => Value::from(b.next_value()),
                None => Value::from(randomize::next_incrementor()),
            },
        }
    }

    fn render_node(&mut self, node: &Node, blocks: &mut Option<BlockIncrementor>) -> Value {
        match node {
            Node::Literal(v) => v.clone(),
            Node::Field(p) => self.eval(*p, blocks),
            Node::Splice(segments) => {
                let mut out = String::new();
                for s in segments {
                    match s {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Field(p) => match self.eval(*p, blocks) {
                            Value::String(v) => out.push_str(&v),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Value::String(out)
            }
            Node::Array(items) => Value::Array(items.iter().map(|n| self.render_node(n, blocks)).collect()),
            Node::Object(fields) => Value::Object(self.render_fields(fields, blocks)),
        }
    }

    fn render_fields(&mut self, fields: &[(String, Node)], blocks: &mut Option<BlockIncrementor>) -> Map<String, Value> {
        let mut map = Map::with_capacity(fields.len());
        for (k, n) in fields {
            map.insert(k.clone(), self.render_node(n, blocks));
        }
        map
    }
}

/// Stateful renderer for one holder (typically one worker).
pub struct Renderer<'t> {
    template: &'t DocTemplate,
    blocks: Option<BlockIncrementor>,
}

impl<'t> Renderer<'t> {
    pub fn render(&mut self, record: Option<u64>) -> Value {
        let mut rng = rand::rng();
        let mut ctx = RecordContext {
            rng: &mut rng,
            first: None,
            last: None,
            month: None,
        };
        let mut doc = Value::Object(ctx.render_fields(&self.template.root, &mut self.blocks));
        if let (Some(field), Some(n)) = (self.template.id_field.as_deref(), record) {
            set_path(&mut doc, field, Value::from(n));
        }
        doc
    }
}

/// Set a dotted path inside `doc`, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut cur = doc;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        let Some(obj) = cur.as_object_mut() else { return };
        if i == parts.len() - 1 {
            obj.insert(part.to_string(), value);
            return;
        }
        cur = obj.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
}

/// True when `path` names a field that exists in the (uncompiled) template.
pub fn has_path(template: &Value, path: &str) -> bool {
    let mut cur = template;
    for part in path.split('.') {
        match cur.get(part) {
            Some(v) => cur = v,
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placeholder_names(text: &str) -> Vec<String> {
        token_regex()
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    }

    #[test]
    fn test_placeholder_names_round_trip() {
        for p in Placeholder::all() {
            assert_eq!(p.name().parse::<Placeholder>().unwrap(), p);
        }
        assert!("rand_unicorn".parse::<Placeholder>().is_err());
    }

    #[test]
    fn test_discovers_exactly_referenced_set() {
        let t = json!({
            "a": "{{ rand_first }}",
            "b": {"c": ["{{rand_city}}", "x {{ rand_zip_code }} y"]},
            "d": 5,
            "e": "plain"
        });
        let compiled = DocTemplate::compile(&t).unwrap();
        let names: BTreeSet<String> = compiled.referenced().iter().map(|p| p.to_string()).collect();
        let expected: BTreeSet<String> = placeholder_names(&t.to_string()).into_iter().collect();
        assert_eq!(names, expected);
        assert!(!compiled.references(Placeholder::Image));
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = DocTemplate::compile(&json!({"a": "{{ rand_nope }}"})).unwrap_err();
        assert!(err.to_string().contains("rand_nope"));
        assert!(DocTemplate::compile(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_typed_and_spliced_values() {
        let t = DocTemplate::compile(&json!({
            "flag": "{{ rand_bool }}",
            "year": "{{ rand_year }}",
            "label": "born {{ rand_year }}",
            "n": 3
        }))
        .unwrap();
        let d = t.render(None);
        assert!(d["flag"].is_boolean());
        assert!(d["year"].is_i64());
        assert!(d["label"].as_str().unwrap().starts_with("born "));
        assert_eq!(d["n"], 3);
    }

    #[test]
    fn test_id_field_equals_record() {
        let t = DocTemplate::compile(&json!({"record_id": "{{ incrementor }}", "name": "{{ rand_last }}"}))
            .unwrap()
            .with_id_field("record_id");
        for n in [1u64, 17, 999] {
            assert_eq!(t.render(Some(n))["record_id"], n);
        }
    }

    #[test]
    fn test_names_are_coherent_within_document() {
        let t = DocTemplate::compile(&json!({
            "first": "{{ rand_first }}",
            "last": "{{ rand_last }}",
            "email": "{{ rand_email }}",
            "nick": "{{ rand_nickname }}"
        }))
        .unwrap();
        let d = t.render(None);
        let first = d["first"].as_str().unwrap().to_lowercase();
        let last = d["last"].as_str().unwrap().to_lowercase();
        assert_eq!(d["email"], format!("{}.{}@example.com", first, last));
        assert!(d["nick"].as_str().unwrap().ends_with(&last));
    }

    #[test]
    fn test_block_incrementor_per_renderer() {
        let t = DocTemplate::compile(&json!({"seq": "{{ block_incrementor }}"}))
            .unwrap()
            .with_block_size(4);
        let mut r = t.renderer();
        let vals: Vec<u64> = (0..6).map(|_| r.render(None)["seq"].as_u64().unwrap()).collect();
        assert!(vals.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_path_helpers() {
        let mut d = json!({"a": {"b": 1}});
        set_path(&mut d, "a.c.d", json!(2));
        assert_eq!(d["a"]["c"]["d"], 2);
        assert!(has_path(&d, "a.b"));
        assert!(!has_path(&d, "a.x"));
    }
}
