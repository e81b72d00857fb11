//! Error display for the CLI.

use colored::Colorize;
use vmimg_engine::ImgError;

/// Code shown for errors that did not come from the engine.
const INTERNAL_CODE: &str = "InternalError";

/// Plain-text parts of an error message.
#[derive(Debug)]
struct ErrorReport {
    code: &'static str,
    message: String,
    causes: Vec<String>,
    hint: Option<&'static str>,
    status: i32,
}

impl ErrorReport {
    fn new(err: &anyhow::Error, verbose: bool) -> Self {
        let causes = if verbose {
            err.chain().skip(1).map(|cause| cause.to_string()).collect()
        } else {
            Vec::new()
        };

        match err.downcast_ref::<ImgError>() {
            Some(img_err) => Self {
                code: img_err.code(),
                message: img_err.to_string(),
                causes,
                hint: hint(img_err),
                status: img_err.exit_status(),
            },
            None => Self {
                code: INTERNAL_CODE,
                // Causes are listed separately when verbose.
                message: if verbose {
                    err.to_string()
                } else {
                    format!("{err:#}")
                },
                causes,
                hint: None,
                status: 1,
            },
        }
    }
}

/// Print `err` for a human and return the process exit status.
pub fn print_error(err: &anyhow::Error, verbose: bool) -> i32 {
    let report = ErrorReport::new(err, verbose);

    eprintln!(
        "vmimg: {} {}",
        format!("error ({}):", report.code).red().bold(),
        report.message
    );
    for cause in &report.causes {
        eprintln!("    caused by: {cause}");
    }
    if let Some(hint) = report.hint {
        eprintln!("\n{}", hint.yellow());
    }

    report.status
}

fn hint(err: &ImgError) -> Option<&'static str> {
    match err {
        ImgError::NoSources => Some("Hint: Add a source with `vmimg sources -a URL`."),
        ImgError::SourcePing { .. } => {
            Some("Hint: Use `-f` to add the source without checking it.")
        }
        ImgError::OriginNotInstalled { .. } => {
            Some("Hint: Import the origin first, or use `vmimg import` to fetch it.")
        }
        ImgError::ImageHasDependentClones { .. } => {
            Some("Hint: Destroy the instances using this image first.")
        }
        ImgError::Download { .. } => {
            Some("Hint: Check your network connection and the source URL.")
        }
        _ => None,
    }
}
