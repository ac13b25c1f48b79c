use crate::commands::{open_reservations, prepare, CommandResult};

/// One TTL sweep, the same one the server runs on its purge interval.
pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("purge") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let reservations = open_reservations(&config).await?;
        reservations.purge_expired().await.map_err(|error| ("purge", error.to_string(), 5u8))
    });

    match result {
        Ok(purged) => CommandResult::success("purge", format!("purged {purged} expired items")),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("purge", error_class, message, exit_code)
        }
    }
}
