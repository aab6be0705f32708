use cohort::orchestrator::JobConfig;
use std::fs;
use std::path::Path;

/// Load a job TOML file and check it the way `start_job` would.
pub fn load_job(path: &Path) -> Result<JobConfig, Box<dyn std::error::Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read job file '{}': {}", path.display(), e))?;

    let job: JobConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse job file '{}': {}", path.display(), e))?;

    job.validate()
        .map_err(|e| format!("Invalid job '{}': {}", path.display(), e))?;

    Ok(job)
}

pub fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let job = load_job(Path::new(file))?;

    println!("✅ {} is valid", file);
    if let Some(name) = &job.name {
        println!("   name:         {}", name);
    }
    println!("   rounds:       {}", job.target_rounds);
    println!(
        "   participants: {}..={} (quorum {})",
        job.selection.min_participants,
        job.selection.max_participants,
        job.quorum()
    );
    println!("   dimension:    {}", job.initial_parameters.len());
    println!(
        "   privacy:      epsilon {} ({:?}{})",
        job.privacy.epsilon,
        job.privacy.mechanism,
        if job.privacy.require_proof {
            ", proofs required"
        } else {
            ""
        }
    );
    Ok(())
}
