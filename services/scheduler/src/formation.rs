//! Formation expansion: desired counts into concrete jobs.

use flotilla_id::JobName;
use tracing::{debug, warn};

use crate::job::Job;
use crate::release::{App, Config, Formation, Release, Slug};

/// Expands a formation into one job per process type and instance.
///
/// Process types the slug does not declare are skipped, so a formation
/// that outlives a build cannot produce jobs without a command. Jobs are
/// returned ordered by name.
pub fn expand(app: &App, config: &Config, slug: &Slug, formation: &Formation) -> Vec<Job> {
    let mut jobs = Vec::new();

    for (process_type, desired) in formation {
        let Some(command) = slug.process_types.get(process_type) else {
            debug!(
                app = %app.id,
                process_type = %process_type,
                "Skipping process type missing from slug"
            );
            continue;
        };

        for instance in 1..=desired.count {
            let name = match JobName::new(app.id.clone(), process_type.clone(), instance) {
                Ok(name) => name,
                Err(e) => {
                    warn!(
                        app = %app.id,
                        process_type = %process_type,
                        instance,
                        error = %e,
                        "Skipping job with invalid name"
                    );
                    continue;
                }
            };
            jobs.push(Job {
                name,
                environment: config.vars.clone(),
                command: command.clone(),
                image: slug.image.clone(),
            });
        }
    }

    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    jobs
}

/// [`expand`] applied to a whole release.
pub fn expand_release(release: &Release) -> Vec<Job> {
    expand(
        &release.app,
        &release.config,
        &release.slug,
        &release.formation,
    )
}
