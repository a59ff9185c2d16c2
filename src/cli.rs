use std::io;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::io::AsyncReadExt;

use crate::config::default_credentials_path;
use crate::send::SendOptions;
use crate::text::{determine_text_type, TextType};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextTypeArg {
    /// Derive the type from the FILE extension
    Auto,
    Plain,
    Html,
    Markdown,
}

/// Send a message of FILE with signature via Gmail to ADDRESS.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Email addresses of recipients, separated with commas
    #[clap(value_parser = parse_address)]
    pub address: String,

    /// File holding the message body, "-" reads stdin
    #[clap(default_value = "-")]
    pub file: String,

    /// Subject of the message
    #[clap(short, long, default_value = "")]
    pub subject: String,

    /// Append a header to the message
    #[clap(short = 'a', long = "append", value_name = "NAME: VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Text type of the body
    #[clap(short, long, value_enum, default_value_t = TextTypeArg::Auto)]
    pub text_type: TextTypeArg,

    /// Exit without sending if the subject has been already used
    #[clap(long)]
    pub disallow_same_subjects: bool,

    /// Address of the signature
    #[clap(long = "sendas", value_name = "ADDRESS")]
    pub sendas_address: Option<String>,

    /// Run without sending the message
    #[clap(long)]
    pub dry_run: bool,

    /// Path to credentials for the Gmail API
    #[clap(short, long = "creds", value_name = "PATH")]
    pub creds: Option<PathBuf>,

    /// OAuth client-secret JSON to use instead of the built-in client
    #[clap(long, value_name = "PATH")]
    pub client_secret: Option<PathBuf>,

    /// Print the authorization URL without opening a browser
    #[clap(long)]
    pub no_browser: bool,

    /// Give up waiting for the browser authorization after SECS seconds
    #[clap(long, value_name = "SECS")]
    pub auth_timeout: Option<u64>,

    /// Increase verbosity (can be used additively)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_address(value: &str) -> Result<String, String> {
    if value.is_empty() {
        return Err("ADDRESS must not be an empty string".to_string());
    }
    Ok(value.to_string())
}

pub fn parse_header(value: &str) -> Result<(String, String), String> {
    match value.split_once(": ") {
        Some((name, header_value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), header_value.to_string()))
        }
        _ => Err(format!("expected \"NAME: VALUE\", got {:?}", value)),
    }
}

pub fn split_recipients(address: &str) -> Vec<String> {
    address
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

impl Cli {
    pub fn resolved_text_type(&self) -> TextType {
        match self.text_type {
            TextTypeArg::Auto => determine_text_type(&self.file),
            TextTypeArg::Plain => TextType::Plain,
            TextTypeArg::Html => TextType::Html,
            TextTypeArg::Markdown => TextType::Markdown,
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.creds.clone().unwrap_or_else(default_credentials_path)
    }

    pub async fn read_body(&self) -> io::Result<String> {
        if self.file == "-" {
            let mut body = String::new();
            tokio::io::stdin().read_to_string(&mut body).await?;
            Ok(body)
        } else {
            tokio::fs::read_to_string(&self.file).await
        }
    }

    pub fn send_options(&self, body: String) -> SendOptions {
        SendOptions {
            recipients: split_recipients(&self.address),
            subject: self.subject.clone(),
            body,
            text_type: self.resolved_text_type(),
            headers: self.headers.clone(),
            disallow_same_subjects: self.disallow_same_subjects,
            sendas_address: self.sendas_address.clone(),
            dry_run: self.dry_run,
        }
    }
}
