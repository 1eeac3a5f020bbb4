use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod cache;
mod decache;
mod error;
mod extrabind;
mod extrastr;
mod macho;
mod objc;
mod output;
mod reader;

use cache::DyldCache;
use decache::Decacher;
use output::OutputLayout;

#[derive(Parser)]
#[command(name = "dsc-decache")]
#[command(about = "Reconstructs standalone Mach-O files from a dyld shared cache")]
struct Cli {
    /// Path to the dyld shared cache file.
    path: PathBuf,

    /// Directory images are written into.
    #[arg(short = 'o', long = "output", default_value = "libraries")]
    output: PathBuf,

    /// Print the cache header, mapping table, and image table instead of
    /// decaching.
    #[arg(short = 'p', long = "print")]
    print: bool,

    /// Restrict decaching to images whose filename, with every extension
    /// stripped, equals this name exactly. May be given multiple times.
    #[arg(short = 'f', long = "filter")]
    filter: Vec<String>,
}

/// The final path component of `path` with every extension stripped, e.g.
/// `/usr/lib/libSystem.B.dylib` -> `libSystem`.
fn stem_name(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.find('.') {
        Some(i) => &file[..i],
        None => file,
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let cache = match DyldCache::open(&cli.path) {
        Ok(cache) => cache,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.print {
        cache.print_info();
        return ExitCode::SUCCESS;
    }

    let mut layout = OutputLayout::new(cli.output);
    let total = cache.image_count();

    for idx in 0..total {
        let path = cache.path_of_image(idx);
        if !cli.filter.is_empty() && !cli.filter.iter().any(|f| stem_name(path) == f) {
            continue;
        }

        log::info!("decaching {}/{}: {}", idx + 1, total, path);
        if let Err(e) = save_one_image(&cache, idx, &mut layout) {
            log::error!("skipping {}: {}", path, e);
        }
    }

    ExitCode::SUCCESS
}

fn save_one_image(cache: &DyldCache, idx: usize, layout: &mut OutputLayout) -> error::Result<()> {
    let path = cache.path_of_image(idx);
    let dest = layout.destination_for(path)?;
    let header_addr = cache.image_address(idx);

    if let Some(existing) = layout.already_written(header_addr) {
        let existing = existing.to_path_buf();
        layout.symlink_dup(&dest, &existing)?;
        return Ok(());
    }

    let Some(decacher) = Decacher::new(cache, idx) else {
        log::warn!("{}: no Mach-O segments found, skipping", path);
        return Ok(());
    };

    let bytes = decacher.run()?;
    std::fs::write(&dest, &bytes)?;
    layout.record_written(header_addr, dest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_name_strips_every_extension() {
        assert_eq!(stem_name("/usr/lib/libSystem.B.dylib"), "libSystem");
        assert_eq!(stem_name("/usr/lib/libfoo.dylib"), "libfoo");
        assert_eq!(stem_name("noext"), "noext");
        assert_eq!(stem_name("/usr/lib/noext"), "noext");
    }
}
