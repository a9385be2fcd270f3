//! Content rendering
//!
//! Turns an activity record's content object into the Markdown text shown
//! to remote servers, plus its HTML form and hashtags.

use crate::data::{ActivityKind, ContentObject, Renderable};
use crate::error::AppError;

/// Text block produced for one activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    /// Markdown source, permalink included
    pub markdown: String,
    /// Sanitized HTML rendering of `markdown`
    pub html: String,
    /// Canonical permalink of the content object
    pub permalink: String,
    /// Hashtag names without the leading `#`
    pub tags: Vec<String>,
}

/// Render `content` as the text for an activity of kind `kind`.
///
/// # Errors
/// - `Configuration` for kinds that have no federated rendering
/// - `Serialization` when the content object lacks a field its variant
///   needs, or does not match `kind`
pub fn render(kind: ActivityKind, content: &ContentObject) -> Result<RenderedContent, AppError> {
    let permalink = content.permalink().trim();
    if permalink.is_empty() {
        return Err(missing_field(kind, "permalink"));
    }
    let link = markdown_link(permalink);

    let markdown = match (kind, content) {
        (ActivityKind::Say, ContentObject::Say { body, .. })
        | (ActivityKind::Repost, ContentObject::Repost { body, .. }) => {
            if body.trim().is_empty() {
                return Err(missing_field(kind, "body"));
            }
            format!("{}\n{}", body.trim_end(), link)
        }
        (ActivityKind::Post, ContentObject::Post { title, .. }) => {
            let title = required(kind, "title", title.as_deref())?;
            format!("{} posted \"{}\"\n{}", content.owner(), title, link)
        }
        (ActivityKind::Pin, ContentObject::Pin { title, url, body, .. }) => {
            let title = required(kind, "title", title.as_deref())?;
            let pinned_url = required(kind, "url", url.as_deref())?;
            let domain = source_domain(pinned_url)?;
            let mut text = format!("{} (from [{}]({}))", title, domain, pinned_url);
            if !body.trim().is_empty() {
                text.push_str("\n\n");
                text.push_str(body.trim_end());
            }
            format!("{}\n{}", text, link)
        }
        (ActivityKind::CheckIn(expected), ContentObject::CheckIn { medium, body, .. })
            if expected == *medium =>
        {
            if body.trim().is_empty() {
                link
            } else {
                format!("{}\n{}", body.trim_end(), link)
            }
        }
        (ActivityKind::Follow, _) => {
            return Err(AppError::Configuration(
                "follow activities have no federated rendering".to_string(),
            ));
        }
        (kind, content) => {
            return Err(AppError::Serialization(format!(
                "{} activity points at {} content",
                kind,
                content.kind_name()
            )));
        }
    };

    Ok(RenderedContent {
        html: markdown_to_html(&markdown),
        markdown,
        permalink: permalink.to_string(),
        tags: content.tags(),
    })
}

/// Render Markdown to HTML safe for remote timelines.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = comrak::Options::default();
    options.extension.autolink = true;
    options.extension.strikethrough = true;
    options.render.escape = true;

    let html = comrak::markdown_to_html(markdown, &options);
    ammonia::clean(html.trim_end())
}

fn markdown_link(url: &str) -> String {
    format!("[{}]({})", url, url)
}

/// Host of a pinned URL, without a leading `www.`
fn source_domain(pinned_url: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(pinned_url)
        .map_err(|e| AppError::Serialization(format!("Invalid pin url {}: {}", pinned_url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Serialization(format!("Pin url has no host: {}", pinned_url)))?;
    Ok(host.trim_start_matches("www.").to_ascii_lowercase())
}

fn required<'a>(
    kind: ActivityKind,
    field: &str,
    value: Option<&'a str>,
) -> Result<&'a str, AppError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing_field(kind, field))
}

fn missing_field(kind: ActivityKind, field: &str) -> AppError {
    AppError::Serialization(format!("{} content is missing {}", kind, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CheckInMedium, ContentMeta};
    use chrono::{TimeZone, Utc};

    const PERMALINK: &str = "https://shelf.example/u/alice/say/1";

    fn meta() -> ContentMeta {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        ContentMeta {
            id: "1".to_string(),
            owner: "alice".to_string(),
            permalink: PERMALINK.to_string(),
            tags: Vec::new(),
            published: at,
            updated: at,
        }
    }

    fn every_kind() -> Vec<(ActivityKind, ContentObject)> {
        vec![
            (
                ActivityKind::Say,
                ContentObject::Say {
                    meta: meta(),
                    body: "hello #world".to_string(),
                },
            ),
            (
                ActivityKind::Repost,
                ContentObject::Repost {
                    meta: meta(),
                    body: "worth reading".to_string(),
                },
            ),
            (
                ActivityKind::Post,
                ContentObject::Post {
                    meta: meta(),
                    title: Some("Reading log".to_string()),
                    body: "long text".to_string(),
                },
            ),
            (
                ActivityKind::Pin,
                ContentObject::Pin {
                    meta: meta(),
                    title: Some("A good essay".to_string()),
                    url: Some("https://www.essays.example/on-reading".to_string()),
                    body: String::new(),
                },
            ),
            (
                ActivityKind::CheckIn(CheckInMedium::Watch),
                ContentObject::CheckIn {
                    meta: meta(),
                    medium: CheckInMedium::Watch,
                    subject: Some("Stalker".to_string()),
                    body: "rewatching".to_string(),
                },
            ),
        ]
    }

    #[test]
    fn every_supported_kind_renders_non_empty_text_with_permalink() {
        for (kind, content) in every_kind() {
            let rendered = render(kind, &content).expect("renderable");
            assert!(!rendered.markdown.is_empty(), "{kind} rendered empty");
            assert!(rendered.markdown.contains(PERMALINK), "{kind}: {}", rendered.markdown);
            assert!(rendered.html.contains(PERMALINK), "{kind}: {}", rendered.html);
            assert_eq!(rendered.permalink, PERMALINK);
        }
    }

    #[test]
    fn say_keeps_raw_body_and_tags() {
        let (kind, content) = every_kind().remove(0);
        let rendered = render(kind, &content).expect("say");
        assert!(rendered.markdown.starts_with("hello #world\n"));
        assert_eq!(rendered.tags, vec!["world"]);
    }

    #[test]
    fn post_announces_owner_and_title() {
        let (kind, content) = every_kind().remove(2);
        let rendered = render(kind, &content).expect("post");
        assert!(rendered.markdown.starts_with("alice posted \"Reading log\""));
        assert!(!rendered.markdown.contains("long text"));
    }

    #[test]
    fn pin_names_source_domain() {
        let (kind, content) = every_kind().remove(3);
        let rendered = render(kind, &content).expect("pin");
        assert!(
            rendered
                .markdown
                .starts_with("A good essay (from [essays.example](https://www.essays.example/on-reading))")
        );
    }

    #[test]
    fn post_without_title_is_a_serialization_error() {
        let content = ContentObject::Post {
            meta: meta(),
            title: None,
            body: "text".to_string(),
        };
        match render(ActivityKind::Post, &content) {
            Err(AppError::Serialization(msg)) => assert!(msg.contains("title")),
            other => panic!("expected serialization error, got: {other:?}"),
        }
    }

    #[test]
    fn mismatched_content_variant_is_rejected() {
        let content = ContentObject::Say {
            meta: meta(),
            body: "hello".to_string(),
        };
        assert!(matches!(
            render(ActivityKind::Pin, &content),
            Err(AppError::Serialization(_))
        ));
        assert!(matches!(
            render(ActivityKind::CheckIn(CheckInMedium::Read), &content),
            Err(AppError::Serialization(_))
        ));
    }

    #[test]
    fn follow_has_no_rendering() {
        let content = ContentObject::Say {
            meta: meta(),
            body: "hello".to_string(),
        };
        assert!(matches!(
            render(ActivityKind::Follow, &content),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn raw_html_in_body_is_escaped() {
        let content = ContentObject::Say {
            meta: meta(),
            body: "<script>alert(1)</script> hi".to_string(),
        };
        let rendered = render(ActivityKind::Say, &content).expect("say");
        assert!(!rendered.html.contains("<script>"));
    }
}
