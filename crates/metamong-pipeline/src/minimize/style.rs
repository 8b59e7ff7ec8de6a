//! Line-oriented model of a test case's `<style>` element.
//!
//! Generated test cases keep one rule per line:
//! `selector { prop: value; prop: value; }`. Lines that do not look like a
//! rule (comments, at-rules spanning lines) are carried verbatim.

/// Rules from the line carrying this marker onward are never reduced.
pub const KEEP_MARKER: &str = "DO NOT REMOVE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleLine {
    Rule {
        selector: String,
        declarations: Vec<String>,
    },
    Verbatim(String),
}

impl StyleLine {
    fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        let (Some(open), true) = (trimmed.find('{'), trimmed.ends_with('}')) else {
            return Some(Self::Verbatim(line.to_string()));
        };
        let selector = trimmed[..open].trim();
        let body = &trimmed[open + 1..trimmed.len() - 1];
        let declarations: Vec<String> = body
            .split(';')
            .map(str::trim)
            .filter(|decl| !decl.is_empty())
            .map(str::to_string)
            .collect();
        if declarations.is_empty() {
            // Empty rules contribute nothing.
            return None;
        }
        Some(Self::Rule {
            selector: selector.to_string(),
            declarations,
        })
    }

    fn render(&self) -> String {
        match self {
            Self::Rule {
                selector,
                declarations,
            } if declarations.is_empty() => format!("{selector} {{ }}"),
            Self::Rule {
                selector,
                declarations,
            } => format!("{selector} {{ {}; }}", declarations.join("; ")),
            Self::Verbatim(text) => text.clone(),
        }
    }

    fn is_marker(&self) -> bool {
        match self {
            Self::Rule {
                selector,
                declarations,
            } => selector.contains(KEEP_MARKER) || declarations.iter().any(|d| d.contains(KEEP_MARKER)),
            Self::Verbatim(text) => text.contains(KEEP_MARKER),
        }
    }
}

/// A document split around its first `<style>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSheet {
    prefix: String,
    lines: Vec<StyleLine>,
    suffix: String,
}

impl StyleSheet {
    /// `None` if the document has no complete `<style>` element.
    #[must_use]
    pub fn parse(html: &str) -> Option<Self> {
        let start = html.find("<style")?;
        let open_end = start + html[start..].find('>')? + 1;
        let close = open_end + html[open_end..].find("</style>")?;

        let lines = html[open_end..close]
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(StyleLine::parse)
            .collect();

        Some(Self {
            prefix: html[..open_end].to_string(),
            lines,
            suffix: html[close..].to_string(),
        })
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.prefix.clone();
        out.push('\n');
        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }
        out.push_str(&self.suffix);
        out
    }

    /// Indices of rule lines eligible for reduction.
    #[must_use]
    pub fn reducible_rules(&self) -> Vec<usize> {
        self.lines
            .iter()
            .take_while(|line| !line.is_marker())
            .enumerate()
            .filter(|(_, line)| matches!(line, StyleLine::Rule { .. }))
            .map(|(i, _)| i)
            .collect()
    }

    #[must_use]
    pub fn declarations(&self, rule: usize) -> &[String] {
        match self.lines.get(rule) {
            Some(StyleLine::Rule { declarations, .. }) => declarations,
            _ => &[],
        }
    }

    /// Copy of this sheet with rule `rule`'s declarations replaced.
    #[must_use]
    pub fn with_declarations(&self, rule: usize, declarations: Vec<String>) -> Self {
        let mut next = self.clone();
        if let Some(StyleLine::Rule {
            declarations: slot, ..
        }) = next.lines.get_mut(rule)
        {
            *slot = declarations;
        }
        next
    }
}

/// Chunk sizes tried per rule, largest first, never exceeding `count`.
#[must_use]
pub fn chunk_sizes(count: usize) -> Vec<usize> {
    [8, 4, 2, 1].into_iter().filter(|size| *size <= count).collect()
}
