//! Content Renderer - Merge-tag substitution and engagement tracking
//!
//! Substitutes `{{field}}` placeholders from the per-recipient merge-field
//! map, injects the open-tracking pixel, and rewrites links through the
//! click-tracking redirect, keyed by the recipient's tracking id.

use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use uuid::Uuid;

/// Renderer for personalizing campaign content
pub struct ContentRenderer {
    /// Base URL the pixel and click redirects are served from
    tracking_base_url: String,
    placeholder_re: Regex,
    href_re: Regex,
}

impl ContentRenderer {
    /// Create a new renderer
    pub fn new(tracking_base_url: impl Into<String>) -> Self {
        Self {
            tracking_base_url: into_trimmed(tracking_base_url.into()),
            placeholder_re: Regex::new(r"\{\{[^}]+\}\}").expect("static regex"),
            href_re: Regex::new(r#"href="([^"]+)""#).expect("static regex"),
        }
    }

    /// Render a subject line: merge fields only, no tracking
    pub fn render_subject(&self, subject: &str, email: &str, merge_fields: &Value) -> String {
        let rendered = self.substitute(subject, email, merge_fields);
        self.strip_unused(&rendered)
    }

    /// Render an HTML body: merge fields, click rewriting, tracking pixel
    pub fn render_html(
        &self,
        template: &str,
        email: &str,
        merge_fields: &Value,
        tracking_id: Uuid,
    ) -> String {
        let rendered = self.substitute(template, email, merge_fields);
        let rendered = self.strip_unused(&rendered);
        let rendered = self.rewrite_links(&rendered, tracking_id);
        self.inject_pixel(&rendered, tracking_id)
    }

    /// Render a plain-text body: merge fields only
    pub fn render_text(&self, template: &str, email: &str, merge_fields: &Value) -> String {
        let rendered = self.substitute(template, email, merge_fields);
        self.strip_unused(&rendered)
    }

    fn substitute(&self, template: &str, email: &str, merge_fields: &Value) -> String {
        let mut result = template.replace("{{email}}", email);

        if let Some(fields) = merge_fields.as_object() {
            for (key, value) in fields {
                let placeholder = format!("{{{{{}}}}}", key);
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => value.to_string(),
                };
                result = result.replace(&placeholder, &value_str);
            }
        }

        result
    }

    fn strip_unused(&self, content: &str) -> String {
        self.placeholder_re.replace_all(content, "").to_string()
    }

    /// Rewrite http(s) links through the click redirect. Anchors, mailto
    /// links, and already-rewritten links pass through untouched.
    fn rewrite_links(&self, html: &str, tracking_id: Uuid) -> String {
        self.href_re
            .replace_all(html, |caps: &regex::Captures<'_>| {
                let target = &caps[1];
                if !target.starts_with("http://") && !target.starts_with("https://") {
                    return caps[0].to_string();
                }
                if target.starts_with(&self.tracking_base_url) {
                    return caps[0].to_string();
                }

                let redirect = format!("{}/click/{}", self.tracking_base_url, tracking_id);
                match Url::parse_with_params(&redirect, &[("url", target)]) {
                    Ok(url) => format!(r#"href="{}""#, url),
                    Err(_) => caps[0].to_string(),
                }
            })
            .to_string()
    }

    /// Insert the 1x1 open-tracking pixel before </body>, or append when the
    /// template has no body tag.
    fn inject_pixel(&self, html: &str, tracking_id: Uuid) -> String {
        let pixel = format!(
            r#"<img src="{}/open/{}" width="1" height="1" alt="" style="display:none" />"#,
            self.tracking_base_url, tracking_id
        );

        match html.rfind("</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + pixel.len());
                out.push_str(&html[..pos]);
                out.push_str(&pixel);
                out.push_str(&html[pos..]);
                out
            }
            None => format!("{}{}", html, pixel),
        }
    }
}

fn into_trimmed(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn renderer() -> ContentRenderer {
        ContentRenderer::new("https://track.example.com/t")
    }

    fn fields() -> Value {
        serde_json::json!({
            "first_name": "Ada",
            "company": "Acme Corp",
            "seats": 5
        })
    }

    #[test]
    fn test_substitutes_merge_fields() {
        let out = renderer().render_subject(
            "Hi {{first_name}}, news for {{company}}",
            "ada@example.com",
            &fields(),
        );
        assert_eq!(out, "Hi Ada, news for Acme Corp");
    }

    #[test]
    fn test_email_and_numeric_fields() {
        let out = renderer().render_text(
            "{{email}} has {{seats}} seats",
            "ada@example.com",
            &fields(),
        );
        assert_eq!(out, "ada@example.com has 5 seats");
    }

    #[test]
    fn test_strips_unknown_placeholders() {
        let out = renderer().render_subject("Hello {{nope}}!", "a@b.c", &fields());
        assert_eq!(out, "Hello !");
    }

    #[test]
    fn test_injects_pixel_before_body_close() {
        let tid = Uuid::new_v4();
        let out = renderer().render_html("<html><body>hi</body></html>", "a@b.c", &fields(), tid);

        let pixel_pos = out.find("/open/").unwrap();
        let body_pos = out.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
        assert!(out.contains(&format!("https://track.example.com/t/open/{}", tid)));
    }

    #[test]
    fn test_appends_pixel_without_body_tag() {
        let tid = Uuid::new_v4();
        let out = renderer().render_html("<p>hi</p>", "a@b.c", &fields(), tid);
        assert!(out.ends_with(r#"style="display:none" />"#));
    }

    #[test]
    fn test_rewrites_links_through_redirect() {
        let tid = Uuid::new_v4();
        let out = renderer().render_html(
            r#"<a href="https://shop.example.com/sale?x=1">sale</a>"#,
            "a@b.c",
            &fields(),
            tid,
        );

        assert!(out.contains(&format!("https://track.example.com/t/click/{}?url=", tid)));
        // Original target survives urlencoded in the query
        assert!(out.contains("shop.example.com"));
        assert!(!out.contains(r#"href="https://shop.example.com"#));
    }

    #[test]
    fn test_leaves_mailto_and_anchors_alone() {
        let tid = Uuid::new_v4();
        let html = r##"<a href="mailto:x@y.z">mail</a><a href="#top">top</a>"##;
        let out = renderer().render_html(html, "a@b.c", &fields(), tid);
        assert!(out.contains(r#"href="mailto:x@y.z""#));
        assert!(out.contains(r##"href="#top""##));
    }
}
