use std::{env, fs, path::PathBuf};

fn target_args() -> [clap::Arg; 2] {
    [clap::arg!(<SOURCE> "Source id"), clap::arg!(<URL> "Absolute URL, relative URL or data: pseudo-URL")]
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=OUT_DIR");

    let Some(out_dir) = env::var_os("OUT_DIR").map(PathBuf::from) else {
        return;
    };
    let completions_dir = out_dir.join("completions");
    if fs::create_dir_all(&completions_dir).is_err() {
        return;
    }

    let mut cmd = clap::Command::new("quire")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Quire Contributors")
        .about("Fetch book info, chapter lists and chapter text through source rules")
        .subcommand(clap::Command::new("info").about("Fetch book details").args(target_args()))
        .subcommand(clap::Command::new("toc").about("Fetch the table of contents").args(target_args()))
        .subcommand(
            clap::Command::new("content")
                .about("Fetch chapter text, following continuation pages")
                .args(target_args()),
        )
        .subcommand(clap::Command::new("sources").about("List available source ids"))
        .arg(
            clap::arg!(--sources <DIR> "Directory of <id>.json source definitions")
                .global(true)
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            clap::arg!(-o --output <FILE> "Output file (default: stdout)")
                .global(true)
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
        .arg(
            clap::arg!(-f --format <FORMAT> "Output format (text, json)")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"]),
        )
        .arg(clap::arg!(--timeout <SECS> "HTTP timeout in seconds").global(true).default_value("30"))
        .arg(clap::arg!(--"script-timeout" <MS> "Script timeout in milliseconds").global(true).default_value("5000"))
        .arg(clap::arg!(--"user-agent" <UA> "Custom User-Agent for requests whose source sets none").global(true))
        .arg(clap::arg!(--cookie <COOKIE> "Cookie header sent to the requested URL's origin").global(true))
        .arg(clap::arg!(--"max-pages" <NUM> "Maximum pages followed for chapter content").global(true).default_value("8"))
        .arg(clap::arg!(-v --verbose "Enable debug logging").global(true));

    for shell in [
        clap_complete::Shell::Bash,
        clap_complete::Shell::Zsh,
        clap_complete::Shell::Fish,
        clap_complete::Shell::PowerShell,
    ] {
        if let Err(e) = clap_complete::generate_to(shell, &mut cmd, "quire", &completions_dir) {
            println!("cargo:warning=Failed to generate {} completions: {}", shell, e);
        }
    }

    println!("cargo:warning=Shell completions generated in: {}", completions_dir.display());
}
