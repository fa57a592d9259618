//! Terminal output: spinner for `run`, coloured step results and status tables.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::draft::{Draft, Stage};
use crate::pipeline::{StepOutcome, StepReport};

struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn for_stage(&self, stage: Stage) -> &Style {
        match stage {
            Stage::Saved => &self.green,
            Stage::Failed => &self.red,
            _ => &self.yellow,
        }
    }
}

fn outcome_line(p: &Palette, outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Idle => format!("  {} nothing to process", p.dim.apply_to("·")),
        StepOutcome::Advanced { draft_id, from, to } => format!(
            "  {} {draft_id}: {from} → {to}",
            p.green.apply_to("✓")
        ),
        StepOutcome::RetryScheduled {
            draft_id,
            stage,
            attempts,
            retry_at,
            failure,
        } => format!(
            "  {} {draft_id}: {stage} attempt {attempts} failed ({}), retry at {}",
            p.yellow.apply_to("↻"),
            failure.code(),
            retry_at.format("%H:%M:%S")
        ),
        StepOutcome::Failed {
            draft_id,
            from,
            failure,
            exhausted,
            ..
        } => format!(
            "  {} {draft_id}: {from} → FAILED ({}{}): {}",
            p.red.apply_to("✗"),
            failure.code(),
            if *exhausted { ", retries exhausted" } else { "" },
            failure.message()
        ),
    }
}

/// Spinner shown while `run` drains the queue.
pub struct RunProgress {
    pb: ProgressBar,
    palette: Palette,
    steps: usize,
}

impl RunProgress {
    pub fn start(worker: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("{worker}: looking for work"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self {
            pb,
            palette: Palette::new(),
            steps: 0,
        }
    }

    pub fn step(&mut self, outcome: &StepOutcome) {
        self.steps += 1;
        self.pb.println(outcome_line(&self.palette, outcome));
        self.pb.set_message(format!("{} steps run", self.steps));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
        let mark = if self.steps == 0 {
            self.palette.dim.apply_to("·")
        } else {
            self.palette.green.apply_to("✓")
        };
        println!("  {mark} {} steps run, queue idle", self.steps);
    }
}

pub fn print_report(report: &StepReport) {
    let p = Palette::new();
    let style = match report.new_stage {
        _ if report.ok => &p.green,
        Some(Stage::Failed) => &p.red,
        _ => &p.yellow,
    };
    let header = style.apply_to("─── Step ───");
    println!("{header}");
    println!(
        "{}",
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
}

pub fn print_status(counts: &[(Stage, u32)], drafts: &[Draft], max_attempts: u32) {
    let p = Palette::new();
    if counts.is_empty() {
        println!("  {}", p.dim.apply_to("no drafts"));
        return;
    }
    for (stage, n) in counts {
        println!("  {} {n}", p.for_stage(*stage).apply_to(format!("{:<12}", stage.as_str())));
    }
    println!();
    for draft in drafts {
        println!(
            "  {}  {} {:<40} {}",
            p.dim.apply_to(draft.id.chars().take(8).collect::<String>()),
            p.for_stage(draft.stage)
                .apply_to(format!("{:<12}", draft.stage.as_str())),
            draft.source.title.chars().take(40).collect::<String>(),
            draft.progress_label(max_attempts)
        );
        if let Some(err) = &draft.diagnostics.last_error {
            println!("            {}", p.red.apply_to(err));
        }
    }
}

pub fn print_draft(draft: &Draft) {
    let p = Palette::new();
    println!("{}", p.for_stage(draft.stage).apply_to("─── Draft ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(draft).unwrap_or_default()
    );
}
