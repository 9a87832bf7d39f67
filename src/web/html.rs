//! Page chrome and small rendering helpers shared by the handlers.

use axum::response::Html;

use crate::auth::{Permission, RequestContext};
use crate::workflow::JobStatus;

pub const APP_TITLE: &str = "Garage Billing";

pub fn esc(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn money(value: f64) -> String {
    format!("{value:.2}")
}

pub fn status_badge(status: JobStatus) -> String {
    format!(
        "<span class=\"badge status-{}\">{}</span>",
        status.as_str(),
        status.label()
    )
}

pub fn error_block(message: Option<&str>) -> String {
    match message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => format!("<div class=\"alert error\">{}</div>", esc(m)),
        None => String::new(),
    }
}

/// `<option>` list; `selected` marks the current value.
pub fn options<'a>(
    items: impl IntoIterator<Item = (&'a str, &'a str)>,
    selected: Option<&str>,
) -> String {
    items
        .into_iter()
        .map(|(value, label)| {
            let sel = if Some(value) == selected { " selected" } else { "" };
            format!(
                "<option value=\"{}\"{sel}>{}</option>",
                esc(value),
                esc(label)
            )
        })
        .collect()
}

fn nav(ctx: &RequestContext) -> String {
    let mut links = vec![
        ("/", "Dashboard"),
        ("/jobs", "Jobs"),
        ("/quotations", "Approvals"),
    ];
    if ctx.has_permission(Permission::GenerateInvoices) {
        links.push(("/invoices", "Invoices"));
    }
    if ctx.has_permission(Permission::ManageInventory) {
        links.push(("/inventory", "Inventory"));
    }
    if ctx.has_permission(Permission::ManageSuppliers) {
        links.push(("/suppliers", "Suppliers"));
    }
    if ctx.has_permission(Permission::ManageUsers) {
        links.push(("/users", "Users"));
    }
    let items: String = links
        .into_iter()
        .map(|(href, label)| format!("<a href=\"{href}\">{label}</a>"))
        .collect();
    format!(
        r#"<nav>{items}<span class="who">{name} ({role})</span>
<form method="post" action="/logout" class="inline"><button type="submit">Log out</button></form></nav>"#,
        name = esc(ctx.display_name()),
        role = ctx.role.label(),
    )
}

/// Full HTML document. `ctx` is `None` on the login and error pages.
pub fn page(title: &str, ctx: Option<&RequestContext>, body: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8"/>
<meta name="viewport" content="width=device-width, initial-scale=1.0"/>
<title>{title} - {APP_TITLE}</title>
<link rel="stylesheet" href="/static/site.css"/>
</head>
<body>
<header><strong>{APP_TITLE}</strong>{nav}</header>
<main>
<h1>{title}</h1>
{body}
</main>
</body>
</html>"#,
        title = esc(title),
        nav = ctx.map(nav).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esc() {
        assert_eq!(
            esc("<b>\"Tom\" & 'Jerry'</b>"),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_options_marks_selected() {
        let html = options([("a", "A"), ("b", "B")], Some("b"));
        assert!(html.contains("<option value=\"b\" selected>B</option>"));
        assert!(html.contains("<option value=\"a\">A</option>"));
    }

    #[test]
    fn test_error_block_skips_empty() {
        assert_eq!(error_block(None), "");
        assert_eq!(error_block(Some("  ")), "");
        assert!(error_block(Some("bad")).contains("bad"));
    }
}
