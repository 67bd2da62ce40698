use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    AssemblyPackage, HashResult, ProgressEvent, ProgressSink, ShowResult, StimulusSetPackage,
};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_stimulus_set(result: &StimulusSetPackage) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_assembly(result: &AssemblyPackage) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_hash(result: &HashResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_stimulus_set(result: &StimulusSetPackage) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "stimulus set {} packaged: {} images",
            result.stimulus_set.name, result.images
        )?;
        writeln!(stdout, "  store   {}", result.image_store.unique_name)?;
        writeln!(stdout, "  url     {}", result.url)?;
        writeln!(stdout, "  sha1    {}", result.image_store.sha1)?;
        writeln!(stdout, "  archive {}", result.archive_path)
    }

    pub fn print_assembly(result: &AssemblyPackage) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "assembly {} ({}) packaged for stimulus set {}",
            result.assembly.name, result.assembly.assembly_class, result.stimulus_set.name
        )?;
        writeln!(stdout, "  store  {}", result.assembly_store.unique_name)?;
        writeln!(stdout, "  url    {}", result.url)?;
        writeln!(stdout, "  sha1   {}", result.assembly_store.sha1)?;
        writeln!(stdout, "  netcdf {}", result.netcdf_path)
    }

    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "{}: {} images",
            result.stimulus_set,
            result.images.len()
        )?;
        for image in &result.images {
            let attributes = image
                .attributes
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(
                stdout,
                "{}\t{}\t{attributes}",
                image.image_id, image.path_within_store
            )?;
        }
        Ok(())
    }

    pub fn print_hash(result: &HashResult) -> io::Result<()> {
        writeln!(io::stdout(), "{}  {}", result.sha1, result.path)
    }
}

/// Reports progress through `tracing`, so `RUST_LOG=info` shows it on stderr.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => {
                tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message)
            }
            None => tracing::info!("{}", event.message),
        }
    }
}
