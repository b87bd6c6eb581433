/// Execute an aggregate command in memory: decide, then apply.
///
/// No persistence and no publication; used by domain tests and by callers that
/// only need the resulting state. Nothing is applied when `handle` rejects the
/// command, so a failed call leaves `aggregate` untouched.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: procura_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
