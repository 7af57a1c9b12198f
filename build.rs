use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    // VERGEN_GIT_SHA is optional at compile time, builds outside a git
    // checkout just print the package version.
    vergen_gitcl::Emitter::default()
        .add_instructions(
            &vergen_gitcl::BuildBuilder::default()
                .build_timestamp(true)
                .build()?,
        )?
        .add_instructions(
            &vergen_gitcl::GitclBuilder::default()
                .sha(true)
                .dirty(true)
                .build()?,
        )?
        .emit()?;
    Ok(())
}
