//! Lossless wikitext tree.
//!
//! `render(&parse(text)) == text` holds for every input: anything that does not
//! form a well-closed link, template, argument, header or gallery stays plain
//! text, and comments plus verbatim tags (`nowiki`, `pre`, `math`, ...) are
//! carried as opaque text.

use std::collections::HashSet;

const OPAQUE_TAGS: &[&str] = &[
    "nowiki",
    "pre",
    "math",
    "syntaxhighlight",
    "source",
    "score",
    "timeline",
];
const REDIRECT_KEYWORD: &str = "#redirect";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Link(Link),
    Template(Template),
    Header(Header),
    /// Raw `{{{name|default}}}` template argument.
    Argument(String),
    Gallery(Gallery),
}

impl Node {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Self::Text(text) | Self::Argument(text) => out.push_str(text),
            Self::Link(link) => link.write_to(out),
            Self::Template(template) => template.write_to(out),
            Self::Header(header) => header.write_to(out),
            Self::Gallery(gallery) => gallery.write_to(out),
        }
    }
}

/// `[[target|param|param]]`. `target` is kept verbatim, including a leading
/// colon and surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub params: Vec<Vec<Node>>,
}

impl Link {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: Vec::new(),
        }
    }

    fn write_to(&self, out: &mut String) {
        out.push_str("[[");
        out.push_str(&self.target);
        for param in &self.params {
            out.push('|');
            write_nodes(param, out);
        }
        out.push_str("]]");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: Vec<Node>,
    pub params: Vec<Parameter>,
}

impl Template {
    /// Rendered name without comments or surrounding whitespace.
    pub fn name_text(&self) -> String {
        strip_comments(&render(&self.name)).trim().to_string()
    }

    /// Replaces the name, keeping the whitespace that surrounded the old one.
    pub fn set_name_text(&mut self, name: &str) {
        self.name = vec![Node::Text(repad(&render(&self.name), name))];
    }

    /// Key of each parameter as MediaWiki resolves it: the trimmed name for
    /// named parameters, the 1-based position for positional ones.
    pub fn param_keys(&self) -> Vec<String> {
        let mut position = 0usize;
        self.params
            .iter()
            .map(|param| match param.name_text() {
                Some(name) => name,
                None => {
                    position += 1;
                    position.to_string()
                }
            })
            .collect()
    }

    /// Index in `params` of the parameter with `key`. Later duplicates win.
    pub fn param_index(&self, key: &str) -> Option<usize> {
        self.param_keys().iter().rposition(|candidate| candidate == key)
    }

    pub fn param(&self, key: &str) -> Option<&Parameter> {
        self.param_index(key).map(|index| &self.params[index])
    }

    pub fn param_mut(&mut self, key: &str) -> Option<&mut Parameter> {
        let index = self.param_index(key)?;
        self.params.get_mut(index)
    }

    pub fn positional_count(&self) -> usize {
        self.params.iter().filter(|param| param.name.is_none()).count()
    }

    fn write_to(&self, out: &mut String) {
        out.push_str("{{");
        write_nodes(&self.name, out);
        for param in &self.params {
            out.push('|');
            param.write_to(out);
        }
        out.push_str("}}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Raw name for `name=value` parameters, including its whitespace.
    pub name: Option<String>,
    pub value: Vec<Node>,
}

impl Parameter {
    pub fn positional(value: Vec<Node>) -> Self {
        Self { name: None, value }
    }

    fn from_nodes(mut nodes: Vec<Node>) -> Self {
        if let Some(Node::Text(first)) = nodes.first()
            && let Some(equals) = first.find('=')
        {
            let name = first[..equals].to_string();
            let rest = first[equals + 1..].to_string();
            if rest.is_empty() {
                nodes.remove(0);
            } else {
                nodes[0] = Node::Text(rest);
            }
            return Self {
                name: Some(name),
                value: nodes,
            };
        }
        Self::positional(nodes)
    }

    pub fn name_text(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(|name| strip_comments(name).trim().to_string())
    }

    pub fn value_text(&self) -> String {
        render(&self.value)
    }

    /// Replaces the value, keeping the whitespace that surrounded the old one.
    pub fn set_value_text(&mut self, value: &str) {
        self.value = vec![Node::Text(repad(&render(&self.value), value))];
    }

    fn write_to(&self, out: &mut String) {
        if let Some(name) = &self.name {
            out.push_str(name);
            out.push('=');
        }
        write_nodes(&self.value, out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub level: usize,
    pub title: Vec<Node>,
    /// Whitespace after the closing `=` run.
    pub trailing: String,
}

impl Header {
    fn write_to(&self, out: &mut String) {
        let marks = "=".repeat(self.level);
        out.push_str(&marks);
        write_nodes(&self.title, out);
        out.push_str(&marks);
        out.push_str(&self.trailing);
    }
}

/// `<gallery>` block. Each body line is one entry: `File name|caption`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gallery {
    pub open: String,
    pub lines: Vec<String>,
    pub close: String,
}

impl Gallery {
    fn write_to(&self, out: &mut String) {
        out.push_str(&self.open);
        out.push_str(&self.lines.join("\n"));
        out.push_str(&self.close);
    }
}

pub fn parse(text: &str) -> Vec<Node> {
    Parser::new(text).parse_nodes(Context::TopLevel)
}

pub fn render(nodes: &[Node]) -> String {
    let mut out = String::new();
    write_nodes(nodes, &mut out);
    out
}

fn write_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        node.write_to(out);
    }
}

/// Calls `on_node` on every node, parents before children.
pub fn visit_mut(nodes: &mut [Node], on_node: &mut dyn FnMut(&mut Node)) {
    for node in nodes {
        on_node(node);
        match node {
            Node::Link(link) => {
                for param in &mut link.params {
                    visit_mut(param, on_node);
                }
            }
            Node::Template(template) => {
                visit_mut(&mut template.name, on_node);
                for param in &mut template.params {
                    visit_mut(&mut param.value, on_node);
                }
            }
            Node::Header(header) => visit_mut(&mut header.title, on_node),
            Node::Text(_) | Node::Argument(_) | Node::Gallery(_) => {}
        }
    }
}

pub fn visit(nodes: &[Node], on_node: &mut dyn FnMut(&Node)) {
    for node in nodes {
        on_node(node);
        match node {
            Node::Link(link) => {
                for param in &link.params {
                    visit(param, on_node);
                }
            }
            Node::Template(template) => {
                visit(&template.name, on_node);
                for param in &template.params {
                    visit(&param.value, on_node);
                }
            }
            Node::Header(header) => visit(&header.title, on_node),
            Node::Text(_) | Node::Argument(_) | Node::Gallery(_) => {}
        }
    }
}

fn redirect_link_index(nodes: &[Node]) -> Option<usize> {
    let Some(Node::Text(lead)) = nodes.first() else {
        return None;
    };
    let lead = lead.trim_start();
    if !starts_with_ignore_ascii_case(lead, REDIRECT_KEYWORD) {
        return None;
    }
    let rest = &lead[REDIRECT_KEYWORD.len()..];
    if !rest.chars().all(|ch| ch.is_whitespace() || ch == ':') {
        return None;
    }
    matches!(nodes.get(1), Some(Node::Link(_))).then_some(1)
}

/// The link of a `#REDIRECT [[Target]]` page.
pub fn redirect_link(nodes: &[Node]) -> Option<&Link> {
    match nodes.get(redirect_link_index(nodes)?) {
        Some(Node::Link(link)) => Some(link),
        _ => None,
    }
}

pub fn redirect_link_mut(nodes: &mut [Node]) -> Option<&mut Link> {
    let index = redirect_link_index(nodes)?;
    match nodes.get_mut(index) {
        Some(Node::Link(link)) => Some(link),
        _ => None,
    }
}

/// Redirect target text of a page, if the page is a redirect.
pub fn redirect_target(text: &str) -> Option<String> {
    redirect_link(&parse(text)).map(|link| link.target.trim().to_string())
}

pub fn strip_comments(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start + 4..].find("-->") {
            Some(end) => rest = &rest[start + 4 + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Splits `value` into leading whitespace, core and trailing whitespace.
pub fn split_padding(value: &str) -> (&str, &str, &str) {
    let core_start = value.len() - value.trim_start().len();
    if core_start == value.len() {
        return (value, "", "");
    }
    let core_end = value.trim_end().len();
    (
        &value[..core_start],
        &value[core_start..core_end],
        &value[core_end..],
    )
}

fn repad(old: &str, core: &str) -> String {
    let (leading, _, trailing) = split_padding(old);
    format!("{leading}{core}{trailing}")
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Length of `<tag ...>` when `rest` opens `tag`.
fn open_tag_len(rest: &str, tag: &str) -> Option<usize> {
    if !rest.starts_with('<') || !starts_with_ignore_ascii_case(&rest[1..], tag) {
        return None;
    }
    let after = rest.as_bytes().get(1 + tag.len()).copied()?;
    if !(after == b'>' || after == b'/' || after.is_ascii_whitespace()) {
        return None;
    }
    rest.find('>').map(|end| end + 1)
}

/// Length of a complete opaque element (`<nowiki>...</nowiki>` and friends).
fn opaque_element_len(rest: &str) -> Option<usize> {
    for tag in OPAQUE_TAGS {
        let Some(open) = open_tag_len(rest, tag) else {
            continue;
        };
        if rest[..open].ends_with("/>") {
            return Some(open);
        }
        let close = format!("</{tag}");
        let close_start = open + find_ignore_ascii_case(&rest[open..], &close)?;
        let close_end = close_start + rest[close_start..].find('>')? + 1;
        return Some(close_end);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    TopLevel,
    Inline,
    TemplatePart,
    LinkPart,
    Argument,
}

/// Bracketed constructs whose parse outcome depends only on where they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Construct {
    Argument,
    Template,
    Link,
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    /// Start positions already known not to close, so unbalanced input is
    /// scanned in linear time.
    failed: HashSet<(usize, Construct)>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            failed: HashSet::new(),
        }
    }

    fn attempt(
        &mut self,
        construct: Construct,
        parse: impl FnOnce(&mut Self) -> Option<Node>,
    ) -> Option<Node> {
        let start = self.pos;
        if self.failed.contains(&(start, construct)) {
            return None;
        }
        let node = parse(self);
        if node.is_none() {
            self.pos = start;
            self.failed.insert((start, construct));
        }
        node
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_stop(&self, context: Context) -> bool {
        let rest = self.rest();
        match context {
            Context::TemplatePart => rest.starts_with('|') || rest.starts_with("}}"),
            Context::LinkPart => rest.starts_with('|') || rest.starts_with("]]"),
            Context::Argument => rest.starts_with("}}}"),
            Context::TopLevel | Context::Inline => false,
        }
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || self.src.as_bytes()[self.pos - 1] == b'\n'
    }

    fn parse_nodes(&mut self, context: Context) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        while self.pos < self.src.len() && !self.at_stop(context) {
            let rest = self.rest();
            let structure = if context == Context::TopLevel
                && rest.starts_with('=')
                && self.at_line_start()
            {
                self.try_header()
            } else if rest.starts_with("<!--") {
                let len = rest[4..]
                    .find("-->")
                    .map(|end| end + 7)
                    .unwrap_or(rest.len());
                text.push_str(&rest[..len]);
                self.pos += len;
                continue;
            } else if rest.starts_with('<') {
                if let Some(len) = opaque_element_len(rest) {
                    text.push_str(&rest[..len]);
                    self.pos += len;
                    continue;
                }
                self.try_gallery()
            } else if rest.starts_with("{{{") {
                self.attempt(Construct::Argument, Self::try_argument)
            } else if rest.starts_with("{{") {
                self.attempt(Construct::Template, Self::try_template)
            } else if rest.starts_with("[[") {
                self.attempt(Construct::Link, Self::try_link)
            } else {
                None
            };

            match structure {
                Some(node) => {
                    if !text.is_empty() {
                        nodes.push(Node::Text(std::mem::take(&mut text)));
                    }
                    nodes.push(node);
                }
                None => {
                    if let Some(ch) = rest.chars().next() {
                        text.push(ch);
                        self.pos += ch.len_utf8();
                    }
                }
            }
        }

        if !text.is_empty() {
            nodes.push(Node::Text(text));
        }
        nodes
    }

    fn try_header(&mut self) -> Option<Node> {
        let rest = self.rest();
        let line_end = rest.find('\n').unwrap_or(rest.len());
        let line = &rest[..line_end];
        let body = line.trim_end();
        let leading = body.bytes().take_while(|byte| *byte == b'=').count();
        let trailing = body.bytes().rev().take_while(|byte| *byte == b'=').count();
        if leading == body.len() {
            return None;
        }
        let level = leading.min(trailing).min(6);
        if level == 0 {
            return None;
        }
        let inner = &body[level..body.len() - level];
        let header = Header {
            level,
            title: Parser::new(inner).parse_nodes(Context::Inline),
            trailing: line[body.len()..].to_string(),
        };
        self.pos += line_end;
        Some(Node::Header(header))
    }

    fn try_gallery(&mut self) -> Option<Node> {
        let rest = self.rest();
        let open = open_tag_len(rest, "gallery")?;
        if rest[..open].ends_with("/>") {
            return None;
        }
        let close_start = open + find_ignore_ascii_case(&rest[open..], "</gallery")?;
        let close_end = close_start + rest[close_start..].find('>')? + 1;
        let gallery = Gallery {
            open: rest[..open].to_string(),
            lines: rest[open..close_start]
                .split('\n')
                .map(str::to_string)
                .collect(),
            close: rest[close_start..close_end].to_string(),
        };
        self.pos += close_end;
        Some(Node::Gallery(gallery))
    }

    fn try_argument(&mut self) -> Option<Node> {
        let start = self.pos;
        self.pos += 3;
        self.parse_nodes(Context::Argument);
        if self.rest().starts_with("}}}") {
            self.pos += 3;
            return Some(Node::Argument(self.src[start..self.pos].to_string()));
        }
        self.pos = start;
        None
    }

    fn try_template(&mut self) -> Option<Node> {
        let start = self.pos;
        self.pos += 2;
        let name = self.parse_nodes(Context::TemplatePart);
        let mut params = Vec::new();
        loop {
            let rest = self.rest();
            if rest.starts_with("}}") {
                self.pos += 2;
                return Some(Node::Template(Template { name, params }));
            }
            if rest.starts_with('|') {
                self.pos += 1;
                let nodes = self.parse_nodes(Context::TemplatePart);
                params.push(Parameter::from_nodes(nodes));
                continue;
            }
            self.pos = start;
            return None;
        }
    }

    fn try_link(&mut self) -> Option<Node> {
        let start = self.pos;
        let after_open = &self.rest()[2..];
        let end = after_open.find(|ch| matches!(ch, '|' | ']' | '[' | '{' | '}' | '<' | '\n'))?;
        let terminator = &after_open[end..];
        if !(terminator.starts_with('|') || terminator.starts_with("]]")) {
            return None;
        }
        let target = &after_open[..end];
        if target.trim().is_empty() {
            return None;
        }
        let mut link = Link::new(target);
        self.pos += 2 + end;
        loop {
            let rest = self.rest();
            if rest.starts_with("]]") {
                self.pos += 2;
                return Some(Node::Link(link));
            }
            if rest.starts_with('|') {
                self.pos += 1;
                link.params.push(self.parse_nodes(Context::LinkPart));
                continue;
            }
            self.pos = start;
            return None;
        }
    }
}
