use crate::commands::{prepare, CommandResult};
use mesa_db::store::{open_pool, MEMORY_URL};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("migrate") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    if config.database.url.trim() == MEMORY_URL {
        return CommandResult::success("migrate", "in-memory store needs no migrations");
    }

    let result = runtime.block_on(async {
        let pool =
            open_pool(&config.database).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
