use colored::Colorize;
use fhirload_ingest::{DownloadReport, LoadReport};
use fhirload_ingest::bulk::TaskStatus;
use tabled::builder::Builder;
use tabled::settings::Style;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

pub fn print_download_summary(report: &DownloadReport) {
    let mut builder = Builder::default();
    builder.push_record(["#", "Type", "Status", "Bytes", "File"]);
    for task in &report.tasks {
        let status = match task.status {
            TaskStatus::Done => "done".green().to_string(),
            TaskStatus::Failed => "failed".red().to_string(),
            TaskStatus::Pending | TaskStatus::Active => "incomplete".yellow().to_string(),
        };
        let file = match &task.error {
            Some(err) => err.to_string(),
            None => task.destination.display().to_string(),
        };
        builder.push_record([
            task.index.to_string(),
            task.resource_type.clone(),
            status,
            task.bytes.to_string(),
            file,
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));

    let line = format!(
        "{} of {} files downloaded ({} bytes)",
        report.completed().count(),
        report.tasks.len(),
        report.total_bytes()
    );
    if report.is_success() {
        print_success(&line);
    } else {
        print_warning(&line);
    }
}

pub fn print_load_summary(report: &LoadReport) {
    if !report.types.is_empty() {
        let mut builder = Builder::default();
        builder.push_record(["ResourceType", "Written", "Conflicts", "Batches"]);
        for (resource_type, counts) in &report.types {
            builder.push_record([
                resource_type.clone(),
                counts.written.to_string(),
                counts.conflicts.to_string(),
                counts.batches.to_string(),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    for source in &report.sources {
        if let Some(reason) = &source.skipped {
            print_warning(&format!("skipped {}: {reason}", source.path.display()));
        } else if source.skipped_units > 0 {
            print_warning(&format!(
                "{}: {} invalid record(s) skipped",
                source.path.display(),
                source.skipped_units
            ));
        }
    }

    println!(
        "{}: {}  {}: {}  {}: {}  {}: {:.1?}",
        "Mode".cyan(),
        report.mode,
        "Written".cyan(),
        report.written(),
        "Conflicts".cyan(),
        report.conflicts(),
        "Elapsed".cyan(),
        report.elapsed
    );
}
