use super::{EnvId, EnvStatus, EnvTable};

/// Next runnable environment in slot order, starting just after `after` and
/// wrapping around to `after` itself last.
pub fn next_runnable(envs: &EnvTable, after: Option<EnvId>) -> Option<EnvId> {
    let slots = envs.slots();
    let start = after.map_or(0, |id| id.index() + 1);
    (0..slots)
        .map(|step| (start + step) % slots)
        .filter_map(|index| envs.at(index))
        .find(|env| env.status == EnvStatus::Runnable)
        .map(|env| env.id)
}
