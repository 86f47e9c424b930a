//! Favicon discovery: parse an HTML document (tolerantly, real-world markup
//! is rarely well-formed) and produce a ranked list of icon candidates.

use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, Attribute, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelKind {
    Icon,
    ShortcutIcon,
    AppleTouch,
    AppleTouchPrecomposed,
    MaskIcon,
    FluidIcon,
}

impl RelKind {
    /// Apple variants tend to be better-designed than the plain icon and
    /// win ties.
    fn apple_score(self) -> u8 {
        matches!(self, RelKind::AppleTouch | RelKind::AppleTouchPrecomposed) as u8
    }
}

/// One icon URL with its declared hints, resolved against the document base.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: Url,
    pub rel: RelKind,
    /// Max dimension from the `sizes` attribute; `u32::MAX` for "any",
    /// 0 when absent.
    pub declared_size: u32,
    pub mime: Option<String>,
}

/// Parse `html` and return candidates best-first. `<base>/favicon.ico` is
/// always appended as the last resort, so the result is never empty.
pub fn discover_icons(html: &[u8], base: &Url) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    if let Ok(dom) = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut &*html)
    {
        collect_links(&dom.document, false, base, &mut candidates);
    }

    rank(&mut candidates);

    if let Ok(ico) = base.join("/favicon.ico") {
        candidates.push(Candidate {
            url: ico,
            rel: RelKind::Icon,
            declared_size: 0,
            mime: None,
        });
    }
    candidates
}

fn collect_links(node: &Handle, in_head: bool, base: &Url, out: &mut Vec<Candidate>) {
    let mut here = in_head;
    if let NodeData::Element { name, attrs, .. } = &node.data {
        let tag = name.local.as_ref();
        if tag == "head" {
            here = true;
        } else if here && tag == "link" {
            if let Some(candidate) = candidate_from_link(&attrs.borrow(), base) {
                out.push(candidate);
            }
        }
    }
    for child in node.children.borrow().iter() {
        collect_links(child, here, base, out);
    }
}

fn candidate_from_link(attrs: &[Attribute], base: &Url) -> Option<Candidate> {
    let rel = rel_kind(&attr_value(attrs, "rel")?)?;
    let href = attr_value(attrs, "href")?;
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let url = base.join(href).ok()?;
    Some(Candidate {
        url,
        rel,
        declared_size: attr_value(attrs, "sizes")
            .map(|s| parse_sizes(&s))
            .unwrap_or(0),
        mime: attr_value(attrs, "type").map(|t| t.trim().to_ascii_lowercase()),
    })
}

fn attr_value(attrs: &[Attribute], name: &str) -> Option<String> {
    attrs
        .iter()
        .find(|a| a.name.local.as_ref() == name)
        .map(|a| a.value.to_string())
}

/// Space-split, case-insensitive rel matching.
fn rel_kind(rel: &str) -> Option<RelKind> {
    let mut icon = false;
    let mut shortcut = false;
    let mut kind = None;
    for token in rel.split_ascii_whitespace() {
        match token.to_ascii_lowercase().as_str() {
            "icon" => icon = true,
            "shortcut" => shortcut = true,
            "apple-touch-icon" => kind = Some(RelKind::AppleTouch),
            "apple-touch-icon-precomposed" => kind = Some(RelKind::AppleTouchPrecomposed),
            "mask-icon" => kind = Some(RelKind::MaskIcon),
            "fluid-icon" => kind = Some(RelKind::FluidIcon),
            _ => {}
        }
    }
    kind.or(match (icon, shortcut) {
        (true, true) => Some(RelKind::ShortcutIcon),
        (true, false) => Some(RelKind::Icon),
        _ => None,
    })
}

/// `sizes` is a whitespace-separated list of `WxH` tokens or `any`; the
/// candidate's declared size is the largest dimension named.
fn parse_sizes(sizes: &str) -> u32 {
    sizes
        .split_ascii_whitespace()
        .map(|token| {
            if token.eq_ignore_ascii_case("any") {
                return u32::MAX;
            }
            token
                .to_ascii_lowercase()
                .split_once('x')
                .and_then(|(w, h)| {
                    let w: u32 = w.parse().ok()?;
                    let h: u32 = h.parse().ok()?;
                    Some(w.max(h))
                })
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(0)
}

/// Preferred format first (SVG > PNG ≈ ICO > others), then largest declared
/// size, then Apple variants; the sort is stable so document order breaks
/// remaining ties.
fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        format_score(b)
            .cmp(&format_score(a))
            .then(b.declared_size.cmp(&a.declared_size))
            .then(b.rel.apple_score().cmp(&a.rel.apple_score()))
    });
}

fn format_score(c: &Candidate) -> u8 {
    if let Some(mime) = &c.mime {
        match mime.as_str() {
            "image/svg+xml" => return 2,
            "image/png" | "image/x-icon" | "image/vnd.microsoft.icon" => return 1,
            _ => return 0,
        }
    }
    match c.url.path().rsplit('.').next().unwrap_or("") {
        "svg" => 2,
        "png" | "ico" => 1,
        _ => 0,
    }
}
