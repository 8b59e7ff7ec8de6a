//! Seeded metamorphic mutation generator.
//!
//! Each command is a line of script the driver replays against the loaded
//! page before re-rendering it. The commands are meaning-preserving for a
//! correct browser: state-restoring pairs (scroll then restore) and DOM/CSS
//! edits that a re-serialize-and-reload must reproduce exactly.

use metamong_core::oracle::{DomSnapshot, MutationGenerator, MutatorFactory};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const MIN_MUTATIONS: usize = 1;
const MAX_MUTATIONS: usize = 5;

/// Tags a `TagChange` may swap an element to.
const HTML_TAGS: &[&str] = &[
    "a", "abbr", "address", "article", "aside", "b", "bdi", "blockquote", "button", "canvas",
    "caption", "cite", "code", "details", "dialog", "div", "dl", "em", "fieldset", "figure",
    "footer", "form", "h1", "h2", "h3", "header", "i", "img", "input", "label", "legend", "li",
    "main", "mark", "meter", "nav", "ol", "output", "p", "pre", "progress", "q", "s", "section",
    "select", "small", "span", "strong", "sub", "summary", "sup", "table", "td", "textarea",
    "th", "tr", "u", "ul", "video",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    MoveNode,
    TagChange,
    DelNode,
    DelAttribute,
    DelCss,
    Scroll,
    WindowScroll,
}

/// Draw table: structural rewrites once, the cheaper edits three times.
const WEIGHTED: &[Kind] = &[
    Kind::MoveNode,
    Kind::TagChange,
    Kind::DelNode,
    Kind::DelAttribute,
    Kind::DelCss,
    Kind::Scroll,
    Kind::WindowScroll,
    Kind::DelNode,
    Kind::DelAttribute,
    Kind::DelCss,
    Kind::Scroll,
    Kind::WindowScroll,
    Kind::DelNode,
    Kind::DelAttribute,
    Kind::DelCss,
    Kind::Scroll,
    Kind::WindowScroll,
];

#[derive(Debug)]
pub struct MetaMutator {
    rng: StdRng,
}

impl MetaMutator {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn pick_id<'a>(&mut self, snapshot: &'a DomSnapshot) -> Option<&'a str> {
        snapshot.ids.choose(&mut self.rng).map(String::as_str)
    }

    fn emit(&mut self, kind: Kind, snapshot: &DomSnapshot, out: &mut Vec<String>) -> bool {
        match kind {
            Kind::TagChange => {
                let Some(id) = self.pick_id(snapshot) else {
                    return false;
                };
                let tag = HTML_TAGS.choose(&mut self.rng).copied().unwrap_or("div");
                out.push(format!("window.Mut = new window.TagChange('{id}', '{tag}');"));
            }
            Kind::DelNode => {
                let Some(id) = self.pick_id(snapshot) else {
                    return false;
                };
                out.push(format!("window.Mut = new window.DelNode('{id}');"));
            }
            Kind::MoveNode => {
                let picked: Vec<&String> = snapshot.ids.choose_multiple(&mut self.rng, 2).collect();
                let [from, to] = picked.as_slice() else {
                    return false;
                };
                out.push(format!("window.Mut = new window.MoveNode('{from}', '{to}');"));
            }
            Kind::DelAttribute => {
                let with_attrs: Vec<(&String, &Vec<String>)> = snapshot
                    .attributes
                    .iter()
                    .filter(|(_, names)| !names.is_empty())
                    .collect();
                let Some((id, names)) = with_attrs.choose(&mut self.rng) else {
                    return false;
                };
                let Some(name) = names.choose(&mut self.rng) else {
                    return false;
                };
                out.push(format!("window.Mut = new window.DelAttribute('{id}', '{name}');"));
            }
            Kind::DelCss => {
                if snapshot.css_rule_count == 0 {
                    return false;
                }
                let index = self.rng.gen_range(0..snapshot.css_rule_count);
                out.push(format!("window.Mut = new window.DelCSS({index});"));
            }
            Kind::Scroll => {
                let Some(id) = self.pick_id(snapshot) else {
                    return false;
                };
                let (left, top) = (self.rng.gen_range(0..1000), self.rng.gen_range(0..1000));
                out.push(format!("window.Mut = new MetaScroll('{id}', {left}, {top});"));
                out.push("window.Mut.restore();".to_string());
            }
            Kind::WindowScroll => {
                let (left, top) = (self.rng.gen_range(0..1000), self.rng.gen_range(0..1000));
                out.push(format!("window.Mut = new MetaWScroll({left}, {top});"));
                out.push("window.Mut.restore();".to_string());
            }
        }
        true
    }
}

impl MutationGenerator for MetaMutator {
    fn generate(&mut self, snapshot: &DomSnapshot) -> Vec<String> {
        let count = self.rng.gen_range(MIN_MUTATIONS..=MAX_MUTATIONS);
        let mut out = Vec::new();
        let mut emitted = 0;
        // Bounded so a page with no ids or rules cannot spin forever.
        for _ in 0..count * 4 {
            if emitted == count {
                break;
            }
            let kind = WEIGHTED[self.rng.gen_range(0..WEIGHTED.len())];
            if self.emit(kind, snapshot, &mut out) {
                emitted += 1;
            }
        }
        out
    }
}

/// Hands each worker its own [`MetaMutator`] stream derived from one seed.
#[derive(Debug, Clone, Copy)]
pub struct MetaMutatorFactory {
    seed: u64,
}

impl MetaMutatorFactory {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl MutatorFactory for MetaMutatorFactory {
    fn create(&self, worker: usize) -> Box<dyn MutationGenerator> {
        Box::new(MetaMutator::new(
            self.seed.wrapping_add(worker as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        ))
    }
}
