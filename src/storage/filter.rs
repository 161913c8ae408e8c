use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

pub const WILDCARD_CHARS: [char; 3] = ['*', '?', '['];

/// Include/exclude rules applied to `/`-separated relative paths.
///
/// A path is rejected when it matches an exclude rule and no include rule.
/// Directories are tested in their `dir/` form so that whole subtrees can be pruned.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    exclude: Vec<Regex>,
    include: Vec<Regex>,
}

impl PathFilter {
    pub fn new(
        exclude_globs: &[String],
        include_globs: &[String],
        exclude_regexes: &[String],
        include_regexes: &[String],
    ) -> Result<Self> {
        let mut exclude = Vec::new();
        for glob in exclude_globs {
            exclude.push(compile_glob(glob, false)?);
        }
        for regex in exclude_regexes {
            exclude.push(Regex::new(regex).with_context(|| format!("invalid regex: {regex}"))?);
        }

        let mut include = Vec::new();
        for glob in include_globs {
            include.push(compile_glob(glob, false)?);
        }
        for regex in include_regexes {
            include.push(Regex::new(regex).with_context(|| format!("invalid regex: {regex}"))?);
        }

        Ok(Self { exclude, include })
    }

    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let Some(exclude_rule) = self
            .exclude
            .iter()
            .find(|rule| rule.is_match(relative_path))
        else {
            return false;
        };

        if let Some(include_rule) = self
            .include
            .iter()
            .find(|rule| rule.is_match(relative_path))
        {
            debug!(
                path = relative_path,
                include = include_rule.as_str(),
                "path re-included."
            );
            return false;
        }

        debug!(
            path = relative_path,
            exclude = exclude_rule.as_str(),
            "path excluded."
        );

        true
    }

    pub fn is_excluded_dir(&self, relative_dir: &str) -> bool {
        if relative_dir.is_empty() {
            return false;
        }

        self.is_excluded(&format!("{}/", relative_dir.trim_end_matches('/')))
    }

    /// For paths that were not reached by walking, so their directories were never tested.
    pub fn is_excluded_with_parents(&self, relative_path: &str) -> bool {
        if self.exclude.is_empty() {
            return false;
        }

        relative_path
            .match_indices('/')
            .any(|(index, _)| self.is_excluded(&relative_path[..=index]))
            || self.is_excluded(relative_path)
    }
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(WILDCARD_CHARS)
}

/// Splits `pattern` at its first wildcard character into a literal prefix and the remainder.
pub fn split_at_wildcard(pattern: &str) -> (&str, &str) {
    match pattern.find(WILDCARD_CHARS) {
        Some(index) => pattern.split_at(index),
        None => (pattern, ""),
    }
}

/// `*` and `?` also match `/`, so `*.jpg` matches at any depth.
/// The pattern is anchored at the end, and at the start only when `anchor_start` is set.
pub fn compile_glob(glob: &str, anchor_start: bool) -> Result<Regex> {
    let translated = glob_to_regex(glob, anchor_start);
    Regex::new(&translated).with_context(|| format!("invalid glob pattern: {glob}"))
}

fn glob_to_regex(glob: &str, anchor_start: bool) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut regex = String::from("(?s)");
    if anchor_start {
        regex.push('^');
    }

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    let body: String = chars[i + 1..end]
                        .iter()
                        .map(|c| match c {
                            '\\' | '[' | '&' | '~' => format!("\\{c}"),
                            c => c.to_string(),
                        })
                        .collect();
                    let body = match body.strip_prefix('!') {
                        Some(negated) => format!("^{negated}"),
                        None if body.starts_with('^') => format!("\\{body}"),
                        None => body,
                    };
                    regex.push('[');
                    regex.push_str(&body);
                    regex.push(']');
                    i = end;
                }
                None => regex.push_str("\\["),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'!') {
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        i += 1;
    }

    (i..chars.len()).find(|&j| chars[j] == ']')
}
