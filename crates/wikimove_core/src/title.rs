use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize, Serializer};

use crate::error::TitleError;

pub const NS_MEDIA: i32 = -2;
pub const NS_SPECIAL: i32 = -1;
pub const NS_MAIN: i32 = 0;
pub const NS_TALK: i32 = 1;
pub const NS_USER: i32 = 2;
pub const NS_PROJECT: i32 = 4;
pub const NS_FILE: i32 = 6;
pub const NS_MEDIAWIKI: i32 = 8;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_HELP: i32 = 12;
pub const NS_CATEGORY: i32 = 14;
pub const NS_MODULE: i32 = 828;

const MAX_TITLE_BYTES: usize = 255;
const ILLEGAL_TITLE_CHARS: &[char] = &['[', ']', '{', '}', '|', '<', '>'];

/// How page names in a namespace are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseRule {
    /// First character is upper-cased, the rest compared exactly.
    #[default]
    FirstLetter,
    CaseSensitive,
    /// Compared case-folded, displayed as written.
    CaseInsensitive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub id: i32,
    pub name: String,
    pub aliases: Vec<String>,
    pub case: CaseRule,
}

impl NamespaceInfo {
    pub fn new(id: i32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            aliases: Vec::new(),
            case: CaseRule::FirstLetter,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn with_case(mut self, case: CaseRule) -> Self {
        self.case = case;
        self
    }
}

/// Namespace names, aliases and case rules of one wiki, plus its interwiki prefixes.
#[derive(Debug, Clone)]
pub struct NamespaceTable {
    namespaces: BTreeMap<i32, NamespaceInfo>,
    lookup: HashMap<String, i32>,
    interwiki: BTreeSet<String>,
}

impl Default for NamespaceTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl NamespaceTable {
    pub fn empty() -> Self {
        Self {
            namespaces: BTreeMap::new(),
            lookup: HashMap::new(),
            interwiki: BTreeSet::new(),
        }
    }

    /// The namespaces every MediaWiki installation ships with.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.insert(NamespaceInfo::new(NS_MEDIA, "Media"));
        table.insert(NamespaceInfo::new(NS_SPECIAL, "Special"));
        table.insert(NamespaceInfo::new(NS_MAIN, ""));
        table.insert(NamespaceInfo::new(NS_TALK, "Talk"));
        table.insert(NamespaceInfo::new(NS_USER, "User"));
        table.insert(NamespaceInfo::new(3, "User talk"));
        table.insert(NamespaceInfo::new(NS_PROJECT, "Project"));
        table.insert(NamespaceInfo::new(5, "Project talk"));
        table.insert(NamespaceInfo::new(NS_FILE, "File").with_alias("Image"));
        table.insert(NamespaceInfo::new(7, "File talk").with_alias("Image talk"));
        table.insert(NamespaceInfo::new(NS_MEDIAWIKI, "MediaWiki"));
        table.insert(NamespaceInfo::new(9, "MediaWiki talk"));
        table.insert(NamespaceInfo::new(NS_TEMPLATE, "Template"));
        table.insert(NamespaceInfo::new(11, "Template talk"));
        table.insert(NamespaceInfo::new(NS_HELP, "Help"));
        table.insert(NamespaceInfo::new(13, "Help talk"));
        table.insert(NamespaceInfo::new(NS_CATEGORY, "Category"));
        table.insert(NamespaceInfo::new(15, "Category talk"));
        table.insert(NamespaceInfo::new(NS_MODULE, "Module"));
        table.insert(NamespaceInfo::new(829, "Module talk"));
        table
    }

    /// Adds or replaces a namespace. Names and aliases are matched case-insensitively.
    pub fn insert(&mut self, info: NamespaceInfo) {
        if let Some(previous) = self.namespaces.remove(&info.id) {
            self.lookup.retain(|_, id| *id != previous.id);
        }
        if !info.name.is_empty() {
            self.lookup.insert(lookup_key(&info.name), info.id);
        }
        for alias in &info.aliases {
            self.lookup.insert(lookup_key(alias), info.id);
        }
        self.namespaces.insert(info.id, info);
    }

    pub fn add_interwiki(&mut self, prefix: &str) {
        let key = lookup_key(prefix);
        if !key.is_empty() {
            self.interwiki.insert(key);
        }
    }

    /// Resolves a namespace prefix (name or alias) to its id.
    pub fn lookup(&self, prefix: &str) -> Option<i32> {
        self.lookup.get(&lookup_key(prefix)).copied()
    }

    pub fn is_interwiki(&self, prefix: &str) -> bool {
        self.interwiki.contains(&lookup_key(prefix))
    }

    pub fn get(&self, id: i32) -> Option<&NamespaceInfo> {
        self.namespaces.get(&id)
    }

    pub fn name(&self, id: i32) -> Option<&str> {
        self.namespaces.get(&id).map(|info| info.name.as_str())
    }

    pub fn case_rule(&self, id: i32) -> CaseRule {
        self.namespaces
            .get(&id)
            .map(|info| info.case)
            .unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.namespaces.keys().copied()
    }
}

fn lookup_key(value: &str) -> String {
    normalize_spaces(&value.replace('_', " ")).to_lowercase()
}

/// Canonical identifier of a page.
///
/// Equality, hashing and ordering use the interwiki prefix, the namespace and
/// the page name folded by the namespace's case rule. The fragment is carried
/// along but is never part of page identity.
#[derive(Debug, Clone)]
pub struct Title {
    interwiki: Option<String>,
    namespace: i32,
    namespace_name: String,
    page_name: String,
    fragment: Option<String>,
    key: String,
}

impl Title {
    pub fn new(namespace: i32, page_name: &str, table: &NamespaceTable) -> Result<Self, TitleError> {
        let name = normalize_spaces(&page_name.replace('_', " "));
        if name.is_empty() {
            return Err(TitleError::Empty);
        }
        check_characters(&name)?;
        Self::assemble(None, namespace, &name, None, table)
    }

    pub fn parse(text: &str, table: &NamespaceTable) -> Result<Self, TitleError> {
        Self::parse_with_default(text, NS_MAIN, table)
    }

    /// Parses `text`, placing unprefixed names in `default_namespace`.
    ///
    /// A leading colon forces the main namespace, so `:Foo` parsed with a
    /// Template default is the article `Foo`.
    pub fn parse_with_default(
        text: &str,
        default_namespace: i32,
        table: &NamespaceTable,
    ) -> Result<Self, TitleError> {
        let mut rest = text.trim();
        let mut default_namespace = default_namespace;
        if let Some(stripped) = rest.strip_prefix(':') {
            rest = stripped.trim_start();
            default_namespace = NS_MAIN;
        }

        let (page_part, fragment) = match rest.split_once('#') {
            Some((page, fragment)) => (page, normalize_fragment(fragment)),
            None => (rest, None),
        };
        let page = normalize_spaces(&page_part.replace('_', " "));
        if page.is_empty() {
            return Err(TitleError::Empty);
        }
        check_characters(&page)?;

        if let Some((prefix, remainder)) = page.split_once(':') {
            let prefix = prefix.trim();
            if table.is_interwiki(prefix) {
                let remainder = remainder.trim();
                if remainder.is_empty() {
                    return Err(TitleError::MissingPageName(prefix.to_string()));
                }
                return Ok(Self {
                    interwiki: Some(prefix.to_lowercase()),
                    namespace: NS_MAIN,
                    namespace_name: String::new(),
                    page_name: remainder.to_string(),
                    fragment,
                    key: remainder.to_string(),
                });
            }
            if let Some(namespace) = table.lookup(prefix) {
                let remainder = remainder.trim();
                if remainder.is_empty() {
                    return Err(TitleError::MissingPageName(prefix.to_string()));
                }
                return Self::assemble(None, namespace, remainder, fragment, table);
            }
        }

        Self::assemble(None, default_namespace, &page, fragment, table)
    }

    fn assemble(
        interwiki: Option<String>,
        namespace: i32,
        name: &str,
        fragment: Option<String>,
        table: &NamespaceTable,
    ) -> Result<Self, TitleError> {
        let case = table.case_rule(namespace);
        let page_name = match case {
            CaseRule::FirstLetter => upper_first(name),
            CaseRule::CaseSensitive | CaseRule::CaseInsensitive => name.to_string(),
        };
        let key = match case {
            CaseRule::CaseInsensitive => page_name.to_lowercase(),
            CaseRule::FirstLetter | CaseRule::CaseSensitive => page_name.clone(),
        };
        let namespace_name = table.name(namespace).unwrap_or_default().to_string();
        let full_len = namespace_name.len() + page_name.len() + 1;
        if full_len > MAX_TITLE_BYTES {
            return Err(TitleError::TooLong(full_len));
        }
        Ok(Self {
            interwiki,
            namespace,
            namespace_name,
            page_name,
            fragment,
            key,
        })
    }

    pub fn namespace(&self) -> i32 {
        self.namespace
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace_name
    }

    pub fn page_name(&self) -> &str {
        &self.page_name
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn interwiki(&self) -> Option<&str> {
        self.interwiki.as_deref()
    }

    pub fn is_interwiki(&self) -> bool {
        self.interwiki.is_some()
    }

    pub fn is_file(&self) -> bool {
        !self.is_interwiki() && matches!(self.namespace, NS_FILE | NS_MEDIA)
    }

    pub fn is_category(&self) -> bool {
        !self.is_interwiki() && self.namespace == NS_CATEGORY
    }

    /// `[interwiki:]Namespace:Page name`, without the fragment.
    pub fn full_name(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.interwiki {
            out.push_str(prefix);
            out.push(':');
        }
        if !self.namespace_name.is_empty() {
            out.push_str(&self.namespace_name);
            out.push(':');
        }
        out.push_str(&self.page_name);
        out
    }

    /// Renders the title as it would be written where unprefixed names mean
    /// `default_namespace` (template names, template parameters).
    pub fn name_in(&self, default_namespace: i32) -> String {
        if self.is_interwiki() {
            return self.full_name();
        }
        if self.namespace == default_namespace {
            return self.page_name.clone();
        }
        if self.namespace == NS_MAIN {
            return format!(":{}", self.page_name);
        }
        self.full_name()
    }

    pub fn with_fragment(&self, fragment: Option<&str>) -> Self {
        let mut out = self.clone();
        out.fragment = fragment.and_then(normalize_fragment);
        out
    }

    pub fn without_fragment(&self) -> Self {
        self.with_fragment(None)
    }

    /// Stable storage key for page identity: `<namespace id>:<folded name>`.
    pub fn storage_key(&self) -> String {
        match &self.interwiki {
            Some(prefix) => format!("{prefix}:{}", self.key),
            None => format!("{}:{}", self.namespace, self.key),
        }
    }

    /// Same page and same fragment.
    pub fn same_target(&self, other: &Self) -> bool {
        self == other && self.fragment == other.fragment
    }

    /// The same page name placed in another namespace.
    pub fn in_namespace(&self, namespace: i32, table: &NamespaceTable) -> Result<Self, TitleError> {
        Self::assemble(
            self.interwiki.clone(),
            namespace,
            &self.page_name,
            self.fragment.clone(),
            table,
        )
    }
}

impl PartialEq for Title {
    fn eq(&self, other: &Self) -> bool {
        self.interwiki == other.interwiki
            && self.namespace == other.namespace
            && self.key == other.key
    }
}

impl Eq for Title {}

impl Hash for Title {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.interwiki.hash(state);
        self.namespace.hash(state);
        self.key.hash(state);
    }
}

impl PartialOrd for Title {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Title {
    fn cmp(&self, other: &Self) -> Ordering {
        self.interwiki
            .cmp(&other.interwiki)
            .then(self.namespace.cmp(&other.namespace))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())?;
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

impl Serialize for Title {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn check_characters(value: &str) -> Result<(), TitleError> {
    match value.chars().find(|ch| ILLEGAL_TITLE_CHARS.contains(ch)) {
        Some(ch) => Err(TitleError::IllegalCharacter(ch)),
        None => Ok(()),
    }
}

fn normalize_fragment(value: &str) -> Option<String> {
    let normalized = normalize_spaces(&value.replace('_', " "));
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn upper_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn normalize_spaces(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_was_space = false;

    for ch in value.chars() {
        if ch.is_whitespace() {
            if !previous_was_space {
                output.push(' ');
                previous_was_space = true;
            }
        } else {
            output.push(ch);
            previous_was_space = false;
        }
    }

    output.trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        CaseRule, NS_CATEGORY, NS_FILE, NS_MAIN, NS_TEMPLATE, NamespaceInfo, NamespaceTable, Title,
    };
    use crate::error::TitleError;

    fn table() -> NamespaceTable {
        let mut table = NamespaceTable::standard();
        table.insert(NamespaceInfo::new(3000, "Lore").with_case(CaseRule::CaseSensitive));
        table.insert(NamespaceInfo::new(3002, "Slang").with_case(CaseRule::CaseInsensitive));
        table.add_interwiki("wikipedia");
        table
    }

    #[test]
    fn parse_recognizes_namespaces_and_aliases() {
        let table = table();
        let title = Title::parse("image:Red_dot.png", &table).expect("parse");
        assert_eq!(title.namespace(), NS_FILE);
        assert_eq!(title.full_name(), "File:Red dot.png");

        let category = Title::parse("  category :  Living   people ", &table).expect("parse");
        assert_eq!(category.namespace(), NS_CATEGORY);
        assert_eq!(category.page_name(), "Living people");

        let unknown = Title::parse("Foo: a story", &table).expect("parse");
        assert_eq!(unknown.namespace(), NS_MAIN);
        assert_eq!(unknown.page_name(), "Foo: a story");
    }

    #[test]
    fn first_letter_namespaces_ignore_initial_case() {
        let table = table();
        let lower = Title::parse("old page", &table).expect("parse");
        let upper = Title::parse("Old_page", &table).expect("parse");
        assert_eq!(lower, upper);
        assert_eq!(lower.page_name(), "Old page");
        assert_ne!(lower, Title::parse("Old Page", &table).expect("parse"));
    }

    #[test]
    fn case_sensitive_and_insensitive_namespaces() {
        let table = table();
        let lore_lower = Title::parse("Lore:dragon", &table).expect("parse");
        let lore_upper = Title::parse("Lore:Dragon", &table).expect("parse");
        assert_ne!(lore_lower, lore_upper);
        assert_eq!(lore_lower.page_name(), "dragon");

        let slang_a = Title::parse("Slang:N00B", &table).expect("parse");
        let slang_b = Title::parse("Slang:n00b", &table).expect("parse");
        assert_eq!(slang_a, slang_b);
        assert_eq!(slang_a.page_name(), "N00B");

        let mut set = HashSet::new();
        set.insert(slang_a);
        assert!(set.contains(&slang_b));
    }

    #[test]
    fn fragment_is_not_part_of_identity() {
        let table = table();
        let plain = Title::parse("Alpha", &table).expect("parse");
        let section = Title::parse("Alpha#History_of_it", &table).expect("parse");
        assert_eq!(plain, section);
        assert!(!plain.same_target(&section));
        assert_eq!(section.fragment(), Some("History of it"));
        assert_eq!(section.to_string(), "Alpha#History of it");
        assert!(section.with_fragment(None).same_target(&plain));
    }

    #[test]
    fn interwiki_prefix_is_case_insensitive() {
        let table = table();
        let title = Title::parse("WikiPedia:Some article", &table).expect("parse");
        assert_eq!(title.interwiki(), Some("wikipedia"));
        assert_eq!(title.full_name(), "wikipedia:Some article");
        assert_ne!(title, Title::parse("Some article", &table).expect("parse"));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        let table = table();
        assert_eq!(Title::parse("   ", &table), Err(TitleError::Empty));
        assert_eq!(Title::parse("#Section", &table), Err(TitleError::Empty));
        assert_eq!(
            Title::parse("Foo{{bar}}", &table),
            Err(TitleError::IllegalCharacter('{'))
        );
        assert_eq!(
            Title::parse("Category:", &table),
            Err(TitleError::MissingPageName("Category".to_string()))
        );
        let long = "x".repeat(300);
        assert!(matches!(
            Title::parse(&long, &table),
            Err(TitleError::TooLong(_))
        ));
    }

    #[test]
    fn default_namespace_and_leading_colon() {
        let table = table();
        let template = Title::parse_with_default("Infobox person", NS_TEMPLATE, &table).expect("parse");
        assert_eq!(template.full_name(), "Template:Infobox person");
        assert_eq!(template.name_in(NS_TEMPLATE), "Infobox person");

        let article = Title::parse_with_default(":Main Page", NS_TEMPLATE, &table).expect("parse");
        assert_eq!(article.namespace(), NS_MAIN);
        assert_eq!(article.name_in(NS_TEMPLATE), ":Main Page");

        let lore = Title::parse("Lore:Dragon", &table).expect("parse");
        assert_eq!(lore.name_in(NS_TEMPLATE), "Lore:Dragon");
    }

    #[test]
    fn in_namespace_reapplies_case_rule() {
        let table = table();
        let lore = Title::parse("Lore:dragon", &table).expect("parse");
        let main = lore.in_namespace(NS_MAIN, &table).expect("move");
        assert_eq!(main.full_name(), "Dragon");
    }

    #[test]
    fn ordering_groups_by_namespace() {
        let table = table();
        let mut titles = vec![
            Title::parse("Category:B", &table).expect("parse"),
            Title::parse("Zeta", &table).expect("parse"),
            Title::parse("Alpha", &table).expect("parse"),
        ];
        titles.sort();
        let rendered: Vec<String> = titles.iter().map(Title::full_name).collect();
        assert_eq!(rendered, vec!["Alpha", "Zeta", "Category:B"]);
    }
}
