//! Console rendering of the resolved environment.

pub mod icons;

use console::style;

use crate::config::EnvironmentSpec;
use crate::rees::Resolution;
use crate::source::{BuildContext, CommitInfo};
use crate::spawner::RunningEnvironment;
use icons::{COMMIT, FOLDER, IMAGE, KEY, REPO};

fn commit_line(info: Option<&CommitInfo>) -> String {
    match info {
        Some(info) => {
            let hash = info
                .hash
                .as_deref()
                .map(|h| &h[..h.len().min(12)])
                .unwrap_or("-");
            let subject = info.message.lines().next().unwrap_or_default();
            format!(
                "{} {} {}",
                style(hash).yellow(),
                info.datetime.format("%Y-%m-%d %H:%M"),
                subject
            )
        }
        None => style("unknown").dim().to_string(),
    }
}

/// Tree view of the repository and image that will be used.
pub fn render_summary(
    env: &EnvironmentSpec,
    resolution: &Resolution,
    context: Option<&BuildContext>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}{} {}\n",
        REPO,
        style(env.repository.to_string()).bold(),
        style(format!("({})", env.branch)).dim()
    ));
    out.push_str(&format!(
        "  └─ {}commit {}\n",
        COMMIT,
        commit_line(context.and_then(|c| c.repo_commit.as_ref()))
    ));
    if let Some(context) = context {
        out.push_str(&format!(
            "  └─ {}{}\n",
            FOLDER,
            context.build_dir.display()
        ));
        if let Some(dataset) = &context.dataset_name {
            out.push_str(&format!("  └─ dataset {}\n", style(dataset).cyan()));
        }
    }

    out.push_str(&format!(
        "{}{}\n",
        IMAGE,
        style(resolution.image.reference()).bold()
    ));
    out.push_str(&format!("  └─ registry {}\n", env.registry_url));
    out.push_str(&format!("  └─ source {}\n", resolution.source_name));
    out.push_str(&format!(
        "  └─ {}image commit {}\n",
        COMMIT,
        commit_line(context.and_then(|c| c.image_commit.as_ref()))
    ));
    out
}

pub fn print_summary(
    env: &EnvironmentSpec,
    resolution: &Resolution,
    context: Option<&BuildContext>,
) {
    println!();
    print!("{}", render_summary(env, resolution, context));
    println!();
}

/// Shell exports that reproduce the build environment by hand.
pub fn debug_hint(env: &RunningEnvironment) -> String {
    format!(
        "{}To run the build yourself against this server:\n  export JUPYTER_BASE_URL={}\n  export JUPYTER_TOKEN={}\n  export port={}\n",
        KEY, env.base_url, env.token, env.port
    )
}
