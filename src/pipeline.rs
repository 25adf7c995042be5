//! The compilation pipeline.
//!
//! Passes run in a fixed order over every file, with architecture-neutral
//! and x86_64 IR validation between them. A validation failure marks the
//! file errored; once any file has errored the pipeline aborts rather than
//! driving broken IR into later passes.

use std::io::Write;

use tracing::debug_span;

use ternc_ir::{validate, IrForm};

use crate::context::Context;
use crate::error::BackendError;
use crate::optimize;
use crate::schedule;
use crate::translate;
use crate::x86_64;

/// Validates every file after `phase`; errored files are flagged.
fn validate_all(ctx: &mut Context, phase: &str, form: IrForm) -> Result<(), BackendError> {
    for file in &mut ctx.files {
        if validate(&file.name, phase, &file.frags, form).is_err() {
            file.errored = true;
        }
        if x86_64::validate::validate_arch(&file.name, phase, &file.frags).is_err() {
            file.errored = true;
        }
    }
    let failed = ctx.files.iter().filter(|f| f.errored).count();
    if failed > 0 {
        return Err(BackendError::Aborted {
            failed,
            total: ctx.files.len(),
        });
    }
    Ok(())
}

/// Runs the full middle and back end over the context, leaving allocated
/// assembly in each file entry. Emission is separate so callers choose
/// their sinks.
pub fn compile(ctx: &mut Context) -> Result<(), BackendError> {
    {
        let _span = debug_span!("translate").entered();
        translate::translate(ctx);
    }
    validate_all(ctx, "translation", IrForm::Blocked)?;

    {
        let _span = debug_span!("optimize_blocked").entered();
        for file in &mut ctx.files {
            optimize::optimize_blocked(file);
        }
    }
    validate_all(ctx, "blocked optimization", IrForm::Blocked)?;

    {
        let _span = debug_span!("trace_schedule").entered();
        for file in &mut ctx.files {
            schedule::trace_schedule(file);
        }
    }
    validate_all(ctx, "trace scheduling", IrForm::Linear)?;

    {
        let _span = debug_span!("optimize_linear").entered();
        for file in &mut ctx.files {
            optimize::optimize_linear(file);
        }
    }
    validate_all(ctx, "linear optimization", IrForm::Linear)?;

    {
        let _span = debug_span!("backend").entered();
        for file in &mut ctx.files {
            x86_64::select::select(file);
            x86_64::reduce::reduce(file);
            x86_64::regalloc::allocate(file);
        }
    }
    Ok(())
}

/// Emits one compiled file's assembly into `out`.
pub fn emit_file(
    file: &crate::context::FileEntry,
    out: &mut dyn Write,
) -> Result<(), BackendError> {
    let asm = file
        .asm
        .as_ref()
        .expect("emit_file runs after a successful compile");
    x86_64::emit::emit(asm, out)
}

/// Compiles and renders every file to a string, in driver order. Mostly a
/// test and tooling convenience.
pub fn compile_to_strings(ctx: &mut Context) -> Result<Vec<(String, String)>, BackendError> {
    compile(ctx)?;
    let mut out = Vec::new();
    for file in &ctx.files {
        let mut buffer = Vec::new();
        emit_file(file, &mut buffer)?;
        out.push((
            file.name.clone(),
            String::from_utf8(buffer).expect("emitted assembly is ASCII"),
        ));
    }
    Ok(out)
}
