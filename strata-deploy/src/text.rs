//! Dependency discovery from change content.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::change::{Change, ChangeKey, CodeDependency};

/// Normalizes object names for comparison, e.g. upper-casing.
pub type NameConverter = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Remove `//`, `--` and `/* */` comments, leaving quoted literals intact.
///
/// Each comment is replaced by a single space so tokens on either side stay apart. An unterminated
/// block comment runs to the end of the input.
pub fn remove_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut state = ScanState::Code;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            ScanState::Code => match (c, chars.peek()) {
                ('/', Some('/')) | ('-', Some('-')) => {
                    chars.next();
                    state = ScanState::LineComment;
                    out.push(' ');
                }
                ('/', Some('*')) => {
                    chars.next();
                    state = ScanState::BlockComment;
                    out.push(' ');
                }
                ('\'' | '"', _) => {
                    state = ScanState::Quoted(c);
                    out.push(c);
                }
                _ => out.push(c),
            },
            ScanState::Quoted(quote) => {
                if c == quote {
                    state = ScanState::Code;
                }
                out.push(c);
            }
            ScanState::LineComment => {
                if c == '\n' {
                    state = ScanState::Code;
                    out.push(c);
                }
            }
            ScanState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = ScanState::Code;
                }
            }
        }
    }
    out
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '#' | '$')
}

/// Split content into identifier-like tokens.
pub fn tokenize(content: &str) -> impl Iterator<Item = &str> {
    content.split(|c: char| !is_identifier_char(c)).filter(|t| !t.is_empty())
}

/// Finds references to known object names in change content.
#[derive(Clone)]
pub struct TextDependencyExtractor {
    convert: NameConverter,
}

impl TextDependencyExtractor {
    /// Extractor normalizing names with `convert`.
    pub fn new(convert: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            convert: Arc::new(convert),
        }
    }

    /// Extractor comparing names exactly as written.
    pub fn pass_through() -> Self {
        Self::new(str::to_string)
    }

    /// Compute dependencies for every change whose dependencies are not already set.
    ///
    /// Changes with pre-populated dependencies are left out of the result, as are change types
    /// that do not take part in dependency discovery.
    pub fn calculate_dependencies<'a>(
        &self,
        changes: impl IntoIterator<Item = &'a Change> + Clone,
    ) -> BTreeMap<ChangeKey, BTreeSet<CodeDependency>> {
        let object_names: HashSet<String> = changes
            .clone()
            .into_iter()
            .map(|c| (self.convert)(c.object_name()))
            .collect();

        changes
            .into_iter()
            .filter(|c| c.code_dependencies.is_none() && c.change_type().enrichable_for_dependencies)
            .map(|change| (change.key.clone(), self.dependencies_of(change, &object_names)))
            .collect()
    }

    fn dependencies_of(&self, change: &Change, object_names: &HashSet<String>) -> BTreeSet<CodeDependency> {
        let discovered = self.discover(&change.content, object_names);

        let mut deps: BTreeSet<CodeDependency> = discovered
            .into_iter()
            .filter(|name| !name.eq_ignore_ascii_case(change.object_name()))
            .filter(|name| !change.exclude_dependencies.contains(name))
            .map(CodeDependency::discovered)
            .collect();
        deps.extend(change.include_dependencies.iter().cloned().map(CodeDependency::explicit));

        trace!(change = %change.key, count = deps.len(), "Calculated dependencies");
        deps
    }

    /// Tokens of the comment-stripped content whose converted form is a known object name.
    pub fn discover(&self, content: &str, object_names: &HashSet<String>) -> BTreeSet<String> {
        let stripped = remove_comments(content);
        tokenize(&stripped)
            .filter(|token| object_names.contains(&(self.convert)(token)))
            .map(str::to_string)
            .collect()
    }

    /// Fill in `code_dependencies` on every change that has none, in place.
    pub fn enrich(&self, changes: &mut [Change]) {
        let mut calculated = self.calculate_dependencies(changes.iter());
        for change in changes.iter_mut() {
            if let Some(deps) = calculated.remove(&change.key) {
                change.code_dependencies = Some(deps);
            }
        }
    }
}

impl std::fmt::Debug for TextDependencyExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDependencyExtractor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeType, DependencyKind};

    fn sp(name: &str, content: &str) -> Change {
        Change::rerunnable(ChangeType::sp(), "schema1", name, content)
    }

    fn names(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_calculate_dependencies() {
        let sp1 = sp("sp1", "sp1 sp2('a')").with_include_dependency("manuallyAddedDependency");
        let sp2 = sp("sp2", "sp2");
        let sp_char = sp("sp#", "sp# sp1 ('a')sp2('a')");
        let sp_a = sp("spA", "spA sp1('a') ('a')sp2('a') sp#")
            .with_exclude_dependency("sp1")
            .with_exclude_dependency("sp2");
        let changes = vec![sp1, sp2, sp_char, sp_a];

        let deps = TextDependencyExtractor::pass_through().calculate_dependencies(changes.iter());

        assert_eq!(
            deps[&changes[0].key],
            BTreeSet::from([
                CodeDependency::discovered("sp2"),
                CodeDependency::new("manuallyAddedDependency", DependencyKind::Explicit),
            ])
        );
        assert!(deps[&changes[1].key].is_empty());
        assert_eq!(
            deps[&changes[2].key],
            BTreeSet::from([CodeDependency::discovered("sp1"), CodeDependency::discovered("sp2")])
        );
        assert_eq!(deps[&changes[3].key], BTreeSet::from([CodeDependency::discovered("sp#")]));
    }

    #[test]
    fn test_dependencies_across_schemas() {
        let changes = vec![
            Change::rerunnable(ChangeType::sp(), "schema1", "sp1", "sp1 sp2"),
            Change::rerunnable(ChangeType::sp(), "schema2", "sp2", "sp2"),
            Change::rerunnable(ChangeType::sp(), "schema1", "sp3", "sp3 sp1 sp2"),
            Change::rerunnable(ChangeType::sp(), "schema2", "spA", "spA sp1 sp2 sp3")
                .with_exclude_dependency("sp1")
                .with_exclude_dependency("sp2"),
        ];

        let deps = TextDependencyExtractor::pass_through().calculate_dependencies(changes.iter());

        assert_eq!(
            deps[&changes[2].key],
            BTreeSet::from([CodeDependency::discovered("sp1"), CodeDependency::discovered("sp2")])
        );
        assert_eq!(deps[&changes[3].key], BTreeSet::from([CodeDependency::discovered("sp3")]));
    }

    #[test]
    fn test_comments_are_ignored() {
        let content = "create procedure sp1\n\
            // Comment sp2\n\
            -- Comment sp2\n\
            call sp_3(1234)  -- end of line comment sp5\n\
            /* Comment sp5 */\n\
            /* Comment\n\
            sp5\n\
            \n\
            sp5 */\n\
            call sp4(1234)\n\
            end\n";

        let found = TextDependencyExtractor::pass_through()
            .discover(content, &names(&["sp1", "sp2", "sp_3", "sp4", "sp5"]));

        assert_eq!(found, set(&["sp1", "sp_3", "sp4"]));
    }

    #[test]
    fn test_prefixes_do_not_match() {
        let content = "create procedure sp1\nobj1\nobj1_prefix1\nobj1_prefix1_prefix2\n";
        let found = TextDependencyExtractor::pass_through().discover(content, &names(&["sp1", "obj1"]));
        assert_eq!(found, set(&["sp1", "obj1"]));
    }

    #[test]
    fn test_quoted_comment_markers_are_kept() {
        let stripped = remove_comments("select '--not a comment' from t -- real\nnext");
        assert_eq!(stripped, "select '--not a comment' from t  \nnext");
    }

    #[test]
    fn test_converter_is_applied() {
        let changes = vec![
            Change::rerunnable(ChangeType::view(), "s1", "V1", "create view v1 as select * from tab1"),
            Change::incremental(ChangeType::table(), "s1", "TAB1", "c1", 1, "create table tab1"),
        ];

        let deps = TextDependencyExtractor::new(|n| n.to_uppercase()).calculate_dependencies(changes.iter());

        assert_eq!(deps[&changes[0].key], BTreeSet::from([CodeDependency::discovered("tab1")]));
        assert!(deps[&changes[1].key].is_empty());
    }

    #[test]
    fn test_prepopulated_and_unenriched_changes_are_skipped() {
        let mut changes = vec![
            sp("sp1", "sp2").with_dependencies([CodeDependency::explicit("other")]),
            sp("sp2", "sp1"),
            Change::rerunnable(ChangeType::static_data(), "schema1", "data1", "sp1"),
        ];

        TextDependencyExtractor::pass_through().enrich(&mut changes);

        assert_eq!(
            changes[0].code_dependencies,
            Some(BTreeSet::from([CodeDependency::explicit("other")]))
        );
        assert_eq!(
            changes[1].code_dependencies,
            Some(BTreeSet::from([CodeDependency::discovered("sp1")]))
        );
        assert_eq!(changes[2].code_dependencies, None);
    }
}
