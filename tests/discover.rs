use favkit::discover::{discover_icons, RelKind};
use url::Url;

fn base() -> Url {
    Url::parse("https://example.com/some/page").unwrap()
}

#[test]
fn bare_document_still_yields_favicon_ico() {
    let candidates = discover_icons(b"<html><body>hello</body></html>", &base());
    assert_eq!(candidates.len(), 1);
    assert_eq!(
        candidates[0].url.as_str(),
        "https://example.com/favicon.ico"
    );
    assert_eq!(candidates[0].rel, RelKind::Icon);
}

#[test]
fn collects_and_resolves_head_links() {
    let html = br#"<html><head>
        <link rel="icon" href="/icons/a.png" sizes="32x32" type="image/png">
        <link rel="apple-touch-icon" href="touch.png" sizes="180x180">
        <link rel="stylesheet" href="style.css">
    </head><body></body></html>"#;
    let candidates = discover_icons(html, &base());

    // two links plus the synthetic favicon.ico
    assert_eq!(candidates.len(), 3);
    let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
    assert!(urls.contains(&"https://example.com/icons/a.png"));
    // relative href resolves against the page URL
    assert!(urls.contains(&"https://example.com/some/touch.png"));
    assert_eq!(urls.last().unwrap(), &"https://example.com/favicon.ico");
}

#[test]
fn rel_matching_is_case_insensitive_and_token_based() {
    let html = br##"<html><head>
        <link rel="SHORTCUT ICON" href="/favicon.ico">
        <link rel="Apple-Touch-Icon-Precomposed" href="/pre.png">
        <link rel="mask-icon" href="/mask.svg" color="#000">
        <link rel="fluid-icon" href="/fluid.png">
        <link rel="preload icon" href="/preloaded.png">
        <link rel="alternate" href="/feed.xml">
    </head></html>"##;
    let candidates = discover_icons(html, &base());

    let kinds: Vec<RelKind> = candidates.iter().map(|c| c.rel).collect();
    assert!(kinds.contains(&RelKind::ShortcutIcon));
    assert!(kinds.contains(&RelKind::AppleTouchPrecomposed));
    assert!(kinds.contains(&RelKind::MaskIcon));
    assert!(kinds.contains(&RelKind::FluidIcon));
    // "preload icon" carries the icon token; "alternate" does not
    assert_eq!(candidates.len(), 6);
}

#[test]
fn svg_outranks_png_outranks_unknown() {
    let html = br#"<html><head>
        <link rel="icon" href="/icon.gif">
        <link rel="icon" href="/icon.png" sizes="16x16">
        <link rel="icon" href="/icon.svg" type="image/svg+xml">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    assert_eq!(candidates[0].url.path(), "/icon.svg");
    assert_eq!(candidates[1].url.path(), "/icon.png");
    assert_eq!(candidates[2].url.path(), "/icon.gif");
}

#[test]
fn larger_declared_size_wins_within_a_format() {
    let html = br#"<html><head>
        <link rel="icon" href="/small.png" sizes="16x16">
        <link rel="icon" href="/any.png" sizes="any">
        <link rel="icon" href="/large.png" sizes="16x16 192x192">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    assert_eq!(candidates[0].url.path(), "/any.png");
    assert_eq!(candidates[0].declared_size, u32::MAX);
    assert_eq!(candidates[1].url.path(), "/large.png");
    assert_eq!(candidates[1].declared_size, 192);
    assert_eq!(candidates[2].url.path(), "/small.png");
}

#[test]
fn apple_touch_beats_plain_icon_on_ties() {
    let html = br#"<html><head>
        <link rel="icon" href="/plain.png" sizes="180x180">
        <link rel="apple-touch-icon" href="/touch.png" sizes="180x180">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    assert_eq!(candidates[0].url.path(), "/touch.png");
    assert_eq!(candidates[1].url.path(), "/plain.png");
}

#[test]
fn document_order_breaks_remaining_ties() {
    let html = br#"<html><head>
        <link rel="icon" href="/first.png" sizes="32x32">
        <link rel="icon" href="/second.png" sizes="32x32">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    assert_eq!(candidates[0].url.path(), "/first.png");
    assert_eq!(candidates[1].url.path(), "/second.png");
}

#[test]
fn tolerates_malformed_markup() {
    let html = br#"<head><link rel=icon href=/naked.png sizes=64x64><p>unclosed"#;
    let candidates = discover_icons(html, &base());
    assert_eq!(candidates[0].url.path(), "/naked.png");
    assert_eq!(candidates[0].declared_size, 64);
}

#[test]
fn garbage_sizes_and_empty_hrefs_are_handled() {
    let html = br#"<html><head>
        <link rel="icon" href="/a.png" sizes="bogus">
        <link rel="icon" href="">
        <link rel="icon">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    // only the first link survives, plus favicon.ico
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].declared_size, 0);
}

#[test]
fn protocol_relative_and_absolute_hrefs_resolve() {
    let html = br#"<html><head>
        <link rel="icon" href="//cdn.example.net/icon.png">
        <link rel="icon" href="https://static.example.org/icon2.png">
    </head></html>"#;
    let candidates = discover_icons(html, &base());
    let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
    assert!(urls.contains(&"https://cdn.example.net/icon.png"));
    assert!(urls.contains(&"https://static.example.org/icon2.png"));
}
