use crate::output::{print_fields, print_json};
use anyhow::Context;
use swap_core::{classify, ErrorCategory, RemoteError};

pub fn run(message: &str, detail: Option<&str>, code: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut error = RemoteError::new(message);
    if let Some(detail) = detail {
        error = error.with_detail(detail);
    }
    if let Some(code) = code {
        let category: ErrorCategory = code
            .parse()
            .with_context(|| format!("invalid --code '{code}'"))?;
        error = error.with_code(category);
    }

    let classification = classify(&error);

    if json {
        print_json(&classification)?;
        return Ok(());
    }

    print_fields(&[
        ("category", classification.category.to_string()),
        ("retryable", yes_no(classification.is_retryable)),
        ("refresh", yes_no(classification.should_refresh)),
        ("message", classification.user_message.clone()),
    ]);
    Ok(())
}

fn yes_no(b: bool) -> String {
    let s = if b { "yes" } else { "no" };
    s.to_string()
}
