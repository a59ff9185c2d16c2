use std::fmt;
use std::str::FromStr;

use pulldown_cmark::{html, Options, Parser};

/// How a message body is turned into HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextType {
    Plain,
    Html,
    Markdown,
}

impl TextType {
    pub fn as_str(self) -> &'static str {
        match self {
            TextType::Plain => "plain",
            TextType::Html => "html",
            TextType::Markdown => "markdown",
        }
    }
}

impl fmt::Display for TextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(TextType::Plain),
            "html" => Ok(TextType::Html),
            "markdown" => Ok(TextType::Markdown),
            other => Err(format!("unknown text type: {}", other)),
        }
    }
}

// Only the extension matters; "-" (stdin) falls through to plain.
pub fn determine_text_type(filename: &str) -> TextType {
    if filename.ends_with(".htm") || filename.ends_with(".html") {
        TextType::Html
    } else if filename.ends_with(".md") {
        TextType::Markdown
    } else {
        TextType::Plain
    }
}

pub fn render(text: &str, text_type: TextType) -> String {
    match text_type {
        TextType::Plain => render_plain(text),
        TextType::Html => text.to_string(),
        TextType::Markdown => render_markdown(text),
    }
}

// Each line ends with <br>; a blank line closes the paragraph and opens the next.
fn render_plain(text: &str) -> String {
    let mut html = String::with_capacity(text.len() + 16);
    html.push_str("<p>");
    for line in text.lines() {
        if line.trim().is_empty() {
            html.push_str("</p><p>");
        } else {
            html.push_str(line);
            html.push_str("<br>");
        }
    }
    html.push_str("</p>");
    html
}

fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(text, options);
    let mut html = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut html, parser);
    html
}
