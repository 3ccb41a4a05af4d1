use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{ConfigurationError, Issue, IssueKind};
use crate::registry::TitleMap;
use crate::title::{NS_FILE, NS_MEDIA, NS_TEMPLATE, NamespaceTable, Title};
use crate::wikitext::{
    Gallery, Link, Node, Parameter, Template, parse, redirect_link_mut, render, split_padding,
};

const SUBST_PREFIXES: &[&str] = &["subst:", "safesubst:"];
const PARSER_FUNCTIONS: &[&str] = &[
    "lc", "uc", "lcfirst", "ucfirst", "urlencode", "anchorencode", "fullurl", "localurl",
    "canonicalurl", "filepath", "int", "msg", "msgnw", "raw", "ns", "nse", "padleft",
    "padright", "formatnum", "plural", "grammar", "gender", "tag", "displaytitle",
    "defaultsort", "pagesincategory", "special", "language",
];
const MAGIC_VARIABLES: &[&str] = &[
    "PAGENAME", "PAGENAMEE", "FULLPAGENAME", "FULLPAGENAMEE", "BASEPAGENAME",
    "SUBPAGENAME", "ROOTPAGENAME", "TALKPAGENAME", "NAMESPACE", "NAMESPACEE",
    "SITENAME", "SERVER", "SERVERNAME", "SCRIPTPATH", "CURRENTYEAR", "CURRENTMONTH",
    "CURRENTDAY", "CURRENTTIME", "CURRENTTIMESTAMP", "LOCALYEAR", "LOCALTIME",
    "NUMBEROFARTICLES", "NUMBEROFPAGES", "NUMBEROFFILES", "NUMBEROFUSERS", "REVISIONID",
    "REVISIONUSER", "PAGEID", "CONTENTLANGUAGE", "DIRMARK", "!",
];
const FILE_OPTIONS: &[&str] = &[
    "thumb", "thumbnail", "frame", "framed", "frameless", "border", "left", "right",
    "center", "centre", "none", "baseline", "sub", "super", "top", "text-top", "middle",
    "bottom", "text-bottom", "upright",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Link,
    /// The template's own name.
    Template,
    TemplateParameter,
    Gallery,
    Redirect,
}

impl ReferenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Template => "template",
            Self::TemplateParameter => "template_parameter",
            Self::Gallery => "gallery",
            Self::Redirect => "redirect",
        }
    }
}

/// A located occurrence of a title inside one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReference {
    pub kind: ReferenceKind,
    pub title: Title,
    pub replacement: Option<Title>,
    pub template: Option<String>,
    pub parameter: Option<String>,
}

impl PageReference {
    pub(crate) fn new(kind: ReferenceKind, title: Title, replacement: Option<Title>) -> Self {
        Self {
            kind,
            title,
            replacement,
            template: None,
            parameter: None,
        }
    }
}

impl fmt::Display for PageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.title)?;
        if let Some(template) = &self.template {
            write!(f, " in {{{{{template}}}}}")?;
        }
        if let Some(parameter) = &self.parameter {
            write!(f, " |{parameter}=")?;
        }
        if let Some(replacement) = &self.replacement {
            write!(f, " -> {replacement}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub changes: Vec<PageReference>,
    pub issues: Vec<Issue>,
    /// References to mapped sources still present after rewriting.
    pub remaining: Vec<PageReference>,
}

impl RewriteOutcome {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn merge(&mut self, other: RewriteOutcome) {
        self.changes.extend(other.changes);
        self.issues.extend(other.issues);
        self.remaining.extend(other.remaining);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RewriteOptions {
    /// Synthesize display text whenever the visible text would change, not
    /// only when the namespace changes.
    pub retain_direct_link_text: bool,
    pub check_links_remaining: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterChange {
    pub parameter: String,
    pub from: Title,
    pub to: Title,
}

pub struct HandlerContext<'a> {
    pub map: &'a dyn TitleMap,
    pub namespaces: &'a NamespaceTable,
}

/// Rewrites template parameters that embed titles.
///
/// A handler owns a fixed set of parameters and must not touch any other.
/// Returning `Err` reports a structural mismatch; the handler must leave the
/// template unmodified in that case.
pub trait RewriteHandler {
    fn name(&self) -> String;
    fn owned_parameters(&self) -> Vec<String>;
    fn rewrite(
        &self,
        template: &mut Template,
        cx: &HandlerContext<'_>,
    ) -> Result<Vec<ParameterChange>, String>;
}

/// Template title to parameter handlers.
#[derive(Default)]
pub struct TemplateRules {
    handlers: BTreeMap<Title, Vec<Box<dyn RewriteHandler>>>,
}

impl TemplateRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        template: Title,
        handler: Box<dyn RewriteHandler>,
    ) -> Result<(), ConfigurationError> {
        let handlers = self.handlers.entry(template.without_fragment()).or_default();
        let claimed = handler.owned_parameters();
        for existing in handlers.iter() {
            let owned = existing.owned_parameters();
            if let Some(parameter) = claimed.iter().find(|parameter| owned.contains(parameter)) {
                return Err(ConfigurationError::HandlerCollision {
                    template: template.full_name(),
                    parameter: parameter.clone(),
                    first: existing.name(),
                    second: handler.name(),
                });
            }
        }
        handlers.push(handler);
        Ok(())
    }

    pub fn handlers_for(&self, template: &Title) -> &[Box<dyn RewriteHandler>] {
        self.handlers
            .get(template)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Title> {
        self.handlers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A single parameter holding one page name, e.g. `{{Main|Page}}`.
#[derive(Debug, Clone)]
pub struct TitleParameter {
    pub parameter: String,
    pub default_namespace: i32,
    /// More positional parameters than this is a structural mismatch.
    pub max_positional: Option<usize>,
}

impl RewriteHandler for TitleParameter {
    fn name(&self) -> String {
        format!("title-parameter({})", self.parameter)
    }

    fn owned_parameters(&self) -> Vec<String> {
        vec![self.parameter.clone()]
    }

    fn rewrite(
        &self,
        template: &mut Template,
        cx: &HandlerContext<'_>,
    ) -> Result<Vec<ParameterChange>, String> {
        if let Some(max) = self.max_positional {
            let count = template.positional_count();
            if count > max {
                return Err(format!(
                    "expected at most {max} positional parameters, found {count}"
                ));
            }
        }
        let Some(param) = template.param_mut(&self.parameter) else {
            return Ok(Vec::new());
        };
        let Some(value) = plain_value(param) else {
            return Ok(Vec::new());
        };
        let Ok(title) = Title::parse_with_default(value.trim(), self.default_namespace, cx.namespaces)
        else {
            return Ok(Vec::new());
        };
        let Some(new) = retarget(cx.map, &title) else {
            return Ok(Vec::new());
        };
        param.set_value_text(&render_relative(&new, self.default_namespace));
        Ok(vec![ParameterChange {
            parameter: self.parameter.clone(),
            from: title,
            to: new,
        }])
    }
}

/// A namespace parameter plus a page parameter, e.g. `{{Lore|ns=Old|page=Foo}}`.
#[derive(Debug, Clone)]
pub struct NamespacedTitleParameter {
    pub namespace_parameter: String,
    pub page_parameter: String,
    /// Namespace used when the namespace parameter is absent or empty.
    pub default_namespace: i32,
}

impl RewriteHandler for NamespacedTitleParameter {
    fn name(&self) -> String {
        format!(
            "namespaced-title-parameter({}, {})",
            self.namespace_parameter, self.page_parameter
        )
    }

    fn owned_parameters(&self) -> Vec<String> {
        vec![self.namespace_parameter.clone(), self.page_parameter.clone()]
    }

    fn rewrite(
        &self,
        template: &mut Template,
        cx: &HandlerContext<'_>,
    ) -> Result<Vec<ParameterChange>, String> {
        let Some(page) = template.param(&self.page_parameter).and_then(plain_value) else {
            return Ok(Vec::new());
        };
        let namespace_value = template
            .param(&self.namespace_parameter)
            .map(|param| plain_value(param).ok_or_else(|| "namespace parameter is not plain text".to_string()))
            .transpose()?;
        let namespace_text = namespace_value.as_deref().map(str::trim).unwrap_or_default();
        let namespace = if namespace_text.is_empty() {
            self.default_namespace
        } else {
            cx.namespaces.lookup(namespace_text).ok_or_else(|| {
                format!(
                    "unknown namespace {namespace_text:?} in parameter {}",
                    self.namespace_parameter
                )
            })?
        };
        let (page_name, fragment) = match page.trim().split_once('#') {
            Some((name, fragment)) => (name, Some(fragment)),
            None => (page.trim(), None),
        };
        let Ok(title) = Title::new(namespace, page_name, cx.namespaces) else {
            return Ok(Vec::new());
        };
        let title = title.with_fragment(fragment);
        let Some(new) = retarget(cx.map, &title) else {
            return Ok(Vec::new());
        };
        if new.is_interwiki() {
            return Err(format!("destination {new} cannot be split into namespace and page"));
        }
        if new.namespace() != namespace && namespace_value.is_none() {
            return Err(format!(
                "destination {new} needs parameter {} which is absent",
                self.namespace_parameter
            ));
        }

        if new.namespace() != namespace
            && let Some(param) = template.param_mut(&self.namespace_parameter)
        {
            param.set_value_text(new.namespace_name());
        }
        if let Some(param) = template.param_mut(&self.page_parameter) {
            param.set_value_text(&render_relative(&new, new.namespace()));
        }
        Ok(vec![ParameterChange {
            parameter: self.page_parameter.clone(),
            from: title,
            to: new,
        }])
    }
}

/// A separator-delimited list of page names, e.g. `{{See also|A;B;C}}`.
#[derive(Debug, Clone)]
pub struct TitleListParameter {
    pub parameter: String,
    pub separator: String,
    pub default_namespace: i32,
}

impl RewriteHandler for TitleListParameter {
    fn name(&self) -> String {
        format!("title-list-parameter({})", self.parameter)
    }

    fn owned_parameters(&self) -> Vec<String> {
        vec![self.parameter.clone()]
    }

    fn rewrite(
        &self,
        template: &mut Template,
        cx: &HandlerContext<'_>,
    ) -> Result<Vec<ParameterChange>, String> {
        if self.separator.is_empty() {
            return Err("empty list separator".to_string());
        }
        let Some(param) = template.param_mut(&self.parameter) else {
            return Ok(Vec::new());
        };
        let Some(value) = plain_value(param) else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        let items: Vec<String> = value
            .split(self.separator.as_str())
            .map(|item| {
                let (leading, core, trailing) = split_padding(item);
                let Ok(title) = Title::parse_with_default(core, self.default_namespace, cx.namespaces)
                else {
                    return item.to_string();
                };
                match retarget(cx.map, &title) {
                    Some(new) => {
                        let rendered = render_relative(&new, self.default_namespace);
                        changes.push(ParameterChange {
                            parameter: self.parameter.clone(),
                            from: title,
                            to: new,
                        });
                        format!("{leading}{rendered}{trailing}")
                    }
                    None => item.to_string(),
                }
            })
            .collect();
        if !changes.is_empty() {
            param.value = vec![Node::Text(items.join(&self.separator))];
        }
        Ok(changes)
    }
}

/// Walks a page tree and retargets every reference to a mapped title.
pub struct LinkRewriter<'a> {
    map: &'a dyn TitleMap,
    namespaces: &'a NamespaceTable,
    rules: Option<&'a TemplateRules>,
    options: RewriteOptions,
}

impl<'a> LinkRewriter<'a> {
    pub fn new(map: &'a dyn TitleMap, namespaces: &'a NamespaceTable) -> Self {
        Self {
            map,
            namespaces,
            rules: None,
            options: RewriteOptions::default(),
        }
    }

    pub fn with_rules(mut self, rules: &'a TemplateRules) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_options(mut self, options: RewriteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn rewrite_text(&self, page: &Title, text: &str) -> (String, RewriteOutcome) {
        let mut nodes = parse(text);
        let outcome = self.rewrite_page(page, &mut nodes);
        (render(&nodes), outcome)
    }

    pub fn rewrite_page(&self, page: &Title, nodes: &mut [Node]) -> RewriteOutcome {
        let mut outcome = RewriteOutcome::default();
        self.rewrite_nodes(page, nodes, &mut outcome);
        if self.options.check_links_remaining {
            outcome.remaining = self.find_references(nodes);
            for reference in &outcome.remaining {
                outcome.issues.push(Issue::new(
                    IssueKind::LinksRemaining,
                    page.to_string(),
                    reference.to_string(),
                ));
            }
        }
        outcome
    }

    /// References to mapped sources, without modifying the tree.
    pub fn find_references(&self, nodes: &[Node]) -> Vec<PageReference> {
        let mut found = Vec::new();
        crate::wikitext::visit(nodes, &mut |node| match node {
            Node::Link(link) => {
                if let Some(title) = self.link_title(link)
                    && let Some(new) = retarget(self.map, &title)
                {
                    found.push(PageReference::new(ReferenceKind::Link, title, Some(new)));
                }
            }
            Node::Template(template) => {
                if let Some((_, title)) = self.template_title(template)
                    && let Some(new) = retarget(self.map, &title)
                {
                    found.push(PageReference::new(ReferenceKind::Template, title, Some(new)));
                }
            }
            Node::Gallery(gallery) => {
                for line in &gallery.lines {
                    if let Some((title, _)) = self.gallery_entry(line)
                        && let Some(new) = retarget(self.map, &title)
                    {
                        found.push(PageReference::new(ReferenceKind::Gallery, title, Some(new)));
                    }
                }
            }
            Node::Text(_) | Node::Header(_) | Node::Argument(_) => {}
        });
        found
    }

    fn rewrite_nodes(&self, page: &Title, nodes: &mut [Node], outcome: &mut RewriteOutcome) {
        for node in nodes {
            match node {
                Node::Link(link) => {
                    self.rewrite_link(page, link, outcome);
                    for param in &mut link.params {
                        self.rewrite_nodes(page, param, outcome);
                    }
                }
                Node::Template(template) => {
                    self.rewrite_template(page, template, outcome);
                    self.rewrite_nodes(page, &mut template.name, outcome);
                    for param in &mut template.params {
                        self.rewrite_nodes(page, &mut param.value, outcome);
                    }
                }
                Node::Header(header) => self.rewrite_nodes(page, &mut header.title, outcome),
                Node::Gallery(gallery) => self.rewrite_gallery(page, gallery, outcome),
                Node::Text(_) | Node::Argument(_) => {}
            }
        }
    }

    fn link_title(&self, link: &Link) -> Option<Title> {
        Title::parse(&link.target, self.namespaces).ok()
    }

    /// `Media:` links are looked up under the File namespace and keep their prefix.
    fn retarget_link(&self, title: &Title) -> Option<Title> {
        if title.namespace() != NS_MEDIA || title.is_interwiki() {
            return retarget(self.map, title);
        }
        let file = title.in_namespace(NS_FILE, self.namespaces).ok()?;
        let new = retarget(self.map, &file)?;
        if new.namespace() != NS_FILE || new.is_interwiki() {
            return Some(new);
        }
        new.in_namespace(NS_MEDIA, self.namespaces).ok()
    }

    fn rewrite_link(&self, page: &Title, link: &mut Link, outcome: &mut RewriteOutcome) {
        let Some(title) = self.link_title(link) else {
            return;
        };
        let Some(new) = self.retarget_link(&title) else {
            return;
        };

        let (leading, core, trailing) = split_padding(&link.target);
        let leading_colon = core.starts_with(':');
        let category_tag = title.is_category() && !leading_colon;
        let file_embed = title.namespace() == NS_FILE && !title.is_interwiki() && !leading_colon;
        let media_link = title.namespace() == NS_MEDIA && !title.is_interwiki();
        if (category_tag && !new.is_category())
            || (file_embed && new.namespace() != NS_FILE)
            || (media_link && new.namespace() != NS_MEDIA)
        {
            outcome.issues.push(Issue::new(
                IssueKind::StructuralMismatch,
                page.to_string(),
                format!("{title} is used as a category or file but maps to {new}"),
            ));
            return;
        }

        let needs_colon = leading_colon
            || ((new.is_category() || new.namespace() == NS_FILE) && !category_tag && !file_embed);
        let new_core = format!("{}{}", if needs_colon { ":" } else { "" }, new);
        let visible_old = core.trim_start_matches(':').trim().replace('_', " ");
        let visible_new = new_core.trim_start_matches(':').to_string();
        let new_target = format!("{leading}{new_core}{trailing}");
        let old_target = std::mem::replace(&mut link.target, new_target);

        if !category_tag && !file_embed {
            let pipe_trick = link.params.len() == 1 && render(&link.params[0]).is_empty();
            if pipe_trick {
                link.params[0] = vec![Node::Text(pipe_trick_text(&title))];
            } else if link.params.is_empty() {
                let namespace_changed =
                    new.namespace() != title.namespace() || new.interwiki() != title.interwiki();
                let text_changed = visible_new != visible_old;
                if namespace_changed || (self.options.retain_direct_link_text && text_changed) {
                    link.params.push(vec![Node::Text(visible_old)]);
                }
            }
        }

        tracing::trace!(page = %page, from = %old_target.trim(), to = %link.target.trim(), "rewrote link");
        outcome
            .changes
            .push(PageReference::new(ReferenceKind::Link, title, Some(new)));
    }

    fn template_title(&self, template: &Template) -> Option<(String, Title)> {
        template_target(template, self.namespaces)
    }

    fn rewrite_template(&self, page: &Title, template: &mut Template, outcome: &mut RewriteOutcome) {
        let Some((prefix, title)) = self.template_title(template) else {
            return;
        };
        let display_name = title.full_name();

        if let Some(rules) = self.rules {
            let cx = HandlerContext {
                map: self.map,
                namespaces: self.namespaces,
            };
            for handler in rules.handlers_for(&title) {
                match handler.rewrite(template, &cx) {
                    Ok(changes) => {
                        for change in changes {
                            let mut reference = PageReference::new(
                                ReferenceKind::TemplateParameter,
                                change.from,
                                Some(change.to),
                            );
                            reference.template = Some(display_name.clone());
                            reference.parameter = Some(change.parameter);
                            outcome.changes.push(reference);
                        }
                    }
                    Err(detail) => {
                        tracing::warn!(page = %page, template = %display_name, handler = %handler.name(), %detail, "template does not match its handler");
                        outcome.issues.push(Issue::new(
                            IssueKind::StructuralMismatch,
                            page.to_string(),
                            format!("{{{{{display_name}}}}} {}: {detail}", handler.name()),
                        ));
                    }
                }
            }
        }

        if let Some(new) = retarget(self.map, &title) {
            template.set_name_text(&format!("{prefix}{}", new.name_in(NS_TEMPLATE)));
            outcome
                .changes
                .push(PageReference::new(ReferenceKind::Template, title, Some(new)));
        }
    }

    fn gallery_entry(&self, line: &str) -> Option<(Title, bool)> {
        gallery_file(line, self.namespaces)
    }

    fn rewrite_gallery(&self, page: &Title, gallery: &mut Gallery, outcome: &mut RewriteOutcome) {
        for line in &mut gallery.lines {
            let (file_part, caption) = match line.split_once('|') {
                Some((file, caption)) => (file.to_string(), Some(caption.to_string())),
                None => (line.clone(), None),
            };
            let mut new_file_part = file_part.clone();

            if let Some((title, prefixed)) = self.gallery_entry(line)
                && let Some(new) = retarget(self.map, &title)
            {
                if new.namespace() == NS_FILE && !new.is_interwiki() {
                    let (leading, _, trailing) = split_padding(&file_part);
                    let rendered = if prefixed {
                        new.full_name()
                    } else {
                        new.page_name().to_string()
                    };
                    new_file_part = format!("{leading}{rendered}{trailing}");
                    outcome
                        .changes
                        .push(PageReference::new(ReferenceKind::Gallery, title, Some(new)));
                } else {
                    outcome.issues.push(Issue::new(
                        IssueKind::StructuralMismatch,
                        page.to_string(),
                        format!("gallery entry {title} maps to non-file {new}"),
                    ));
                }
            }

            let new_caption = caption.map(|caption| {
                let mut nodes = parse(&caption);
                self.rewrite_nodes(page, &mut nodes, outcome);
                render(&nodes)
            });
            *line = match new_caption {
                Some(caption) => format!("{new_file_part}|{caption}"),
                None => new_file_part,
            };
        }
    }
}

/// Points a `#REDIRECT` page at `target`. Returns false when the page is not a redirect.
pub fn retarget_redirect(nodes: &mut [Node], target: &Title) -> bool {
    let Some(link) = redirect_link_mut(nodes) else {
        return false;
    };
    let (leading, _, trailing) = split_padding(&link.target);
    let colon = if target.is_category() || target.namespace() == NS_FILE {
        ":"
    } else {
        ""
    };
    link.target = format!("{leading}{colon}{target}{trailing}");
    true
}

/// Replaces file captions that repeated the old file's label with the new label.
/// `renamed` maps each new file title to the title it replaced.
pub fn reconcile_captions(
    nodes: &mut [Node],
    renamed: &BTreeMap<Title, Title>,
    namespaces: &NamespaceTable,
) -> Vec<PageReference> {
    let mut changes = Vec::new();
    crate::wikitext::visit_mut(nodes, &mut |node| match node {
        Node::Link(link) => {
            let Ok(title) = Title::parse(&link.target, namespaces) else {
                return;
            };
            if title.namespace() != NS_FILE || title.is_interwiki() {
                return;
            }
            let Some(old) = renamed.get(&title) else {
                return;
            };
            let Some(caption) = link.params.last_mut() else {
                return;
            };
            let text = render(caption);
            if is_file_option(text.trim()) {
                return;
            }
            if let Some(replacement) = relabel(&text, old, &title) {
                *caption = vec![Node::Text(replacement)];
                let mut reference =
                    PageReference::new(ReferenceKind::Link, old.clone(), Some(title.clone()));
                reference.parameter = Some("caption".to_string());
                changes.push(reference);
            }
        }
        Node::Gallery(gallery) => {
            for line in &mut gallery.lines {
                let Some((file, caption)) = line.split_once('|') else {
                    continue;
                };
                let Ok(title) = Title::parse_with_default(file.trim(), NS_FILE, namespaces) else {
                    continue;
                };
                let Some(old) = renamed.get(&title) else {
                    continue;
                };
                if let Some(replacement) = relabel(caption, old, &title) {
                    let mut reference =
                        PageReference::new(ReferenceKind::Gallery, old.clone(), Some(title.clone()));
                    reference.parameter = Some("caption".to_string());
                    changes.push(reference);
                    *line = format!("{file}|{replacement}");
                }
            }
        }
        Node::Text(_) | Node::Template(_) | Node::Header(_) | Node::Argument(_) => {}
    });
    changes
}

fn relabel(caption: &str, old: &Title, new: &Title) -> Option<String> {
    let (leading, core, trailing) = split_padding(caption);
    let label = if core == old.page_name() {
        new.page_name().to_string()
    } else if core == file_stem(old.page_name()) {
        file_stem(new.page_name()).to_string()
    } else {
        return None;
    };
    (label != core).then(|| format!("{leading}{label}{trailing}"))
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn is_file_option(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    FILE_OPTIONS.contains(&lower.as_str())
        || lower.starts_with("upright")
        || lower.ends_with("px")
        || lower.split_once('=').is_some_and(|(key, _)| {
            matches!(
                key.trim(),
                "alt" | "link" | "class" | "page" | "lang" | "upright" | "thumb" | "thumbtime"
            )
        })
}

/// Mapped destination of `title`, carrying the old fragment unless the
/// destination names its own. `None` when unmapped or unchanged.
fn retarget(map: &dyn TitleMap, title: &Title) -> Option<Title> {
    let new = map.lookup(title)?;
    let new = if new.fragment().is_some() {
        new.clone()
    } else {
        new.with_fragment(title.fragment())
    };
    (!new.same_target(title) || new.full_name() != title.full_name()).then_some(new)
}

fn render_relative(title: &Title, default_namespace: i32) -> String {
    match title.fragment() {
        Some(fragment) => format!("{}#{fragment}", title.name_in(default_namespace)),
        None => title.name_in(default_namespace),
    }
}

/// Visible text produced by MediaWiki's pipe trick for `title`.
fn pipe_trick_text(title: &Title) -> String {
    let name = title.page_name();
    let name = match name.rfind(" (") {
        Some(start) if name.ends_with(')') => &name[..start],
        _ => match name.split_once(", ") {
            Some((head, _)) => head,
            None => name,
        },
    };
    name.trim().to_string()
}

/// Template title, plus the `subst:` prefix it was written with. `None` for
/// parser functions, magic words and names built from markup.
pub(crate) fn template_target(template: &Template, namespaces: &NamespaceTable) -> Option<(String, Title)> {
    if !template.name.iter().all(|node| matches!(node, Node::Text(_))) {
        return None;
    }
    let name = template.name_text();
    let (prefix, bare) = split_subst(&name);
    if is_parser_function(bare) {
        return None;
    }
    let title = Title::parse_with_default(bare, NS_TEMPLATE, namespaces).ok()?;
    Some((prefix.to_string(), title))
}

/// File named by one gallery line, and whether the line spelled out a namespace prefix.
pub(crate) fn gallery_file(line: &str, namespaces: &NamespaceTable) -> Option<(Title, bool)> {
    let file_part = line.split('|').next().unwrap_or_default();
    let file = file_part.trim();
    if file.is_empty() || file.starts_with("<!--") {
        return None;
    }
    let prefixed = file
        .split_once(':')
        .and_then(|(prefix, _)| namespaces.lookup(prefix))
        .is_some();
    let title = Title::parse_with_default(file, NS_FILE, namespaces).ok()?;
    Some((title, prefixed))
}

fn split_subst(name: &str) -> (&str, &str) {
    for prefix in SUBST_PREFIXES {
        if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let (head, rest) = name.split_at(prefix.len());
            return (head, rest.trim_start());
        }
    }
    ("", name)
}

fn is_parser_function(name: &str) -> bool {
    if name.starts_with('#') {
        return true;
    }
    if MAGIC_VARIABLES.contains(&name.trim()) {
        return true;
    }
    match name.split_once(':') {
        Some((head, _)) => {
            let head = head.trim();
            PARSER_FUNCTIONS.contains(&head.to_ascii_lowercase().as_str())
                || MAGIC_VARIABLES.contains(&head)
        }
        None => false,
    }
}

/// Plain text of a parameter value, or `None` when it holds markup that a
/// text rewrite would destroy.
fn plain_value(param: &Parameter) -> Option<String> {
    if !param.value.iter().all(|node| matches!(node, Node::Text(_))) {
        return None;
    }
    let value = param.value_text();
    (!value.contains("<!--")).then_some(value)
}
