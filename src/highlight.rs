//! HTML rendering of per-token feature activations
//!
//! Each token gets a green background whose intensity grows with the
//! activation: red and blue fall from 235 by 20 per unit of activation,
//! never below 100.

use anyhow::Result;

/// Background colour `#rrggbb` for one activation
pub fn activation_color(activation: f32) -> String {
    let level = (235.0 - activation * 20.0).max(100.0) as u8;
    format!("#{level:02x}{:02x}{level:02x}", 255u8)
}

/// Minimal HTML escaping for token text
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Wrap every token in a `<span>` coloured by its activation.
pub fn highlight_tokens_with_intensity(tokens: &[String], activations: &[f32]) -> Result<String> {
    anyhow::ensure!(
        tokens.len() == activations.len(),
        "Got {} tokens but {} activations",
        tokens.len(),
        activations.len()
    );
    Ok(tokens
        .iter()
        .zip(activations)
        .map(|(token, &a)| {
            format!(
                "<span style=\"background-color: {};\">{}</span>",
                activation_color(a),
                escape_html(token)
            )
        })
        .collect())
}

/// Full HTML page with the highlighted tokens and a description of the run.
pub fn create_html(tokens: &[String], activations: &[f32], description: &str) -> Result<String> {
    let body = highlight_tokens_with_intensity(tokens, activations)?;
    Ok(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Highlighted Text Example</title>
    <style>
        body {{
            font-family: Arial, sans-serif;
            font-size: 16px;
            line-height: 1.5;
            margin: 20px;
        }}
    </style>
</head>
<body>
    <h1>Green Intensity Highlighting Example</h1>
    <p>{body}</p>
    <hr>
    <p>Arguments: {}</p>
</body>
</html>
"#,
        escape_html(description)
    ))
}
