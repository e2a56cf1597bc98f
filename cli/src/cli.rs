use clap::Parser;

/// AI-mediated command execution assistant.
///
/// With no request, the interactive shell starts; with one, the words are
/// concatenated into a single one-shot request.
#[derive(Debug, Parser)]
#[command(name = "magus", version)]
pub struct Cli {
    /// Model provider: gemini, chatgpt, claude or mistral. Auto-detected
    /// from API key environment variables when omitted.
    #[arg(long = "provider", value_name = "NAME")]
    pub provider: Option<String>,

    /// Model override for the selected provider.
    #[arg(long = "model", short = 'm', value_name = "MODEL")]
    pub model: Option<String>,

    /// One-shot request text.
    #[arg(trailing_var_arg = true, value_name = "REQUEST")]
    pub request: Vec<String>,
}
