use chrono::{DateTime, Local};

fn build_datetime() -> DateTime<Local> {
    let build_timestamp: i64 = env!("BUILD_TIME").parse().unwrap_or(0);
    DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now)
}

pub fn get_version_info() -> String {
    format!(
        "sipswitch {}\nBuild Time: {}\nGit Commit: {}",
        env!("CARGO_PKG_VERSION"),
        build_datetime().format("%Y-%m-%d %H:%M:%S %Z"),
        env!("GIT_COMMIT_HASH"),
    )
}

/// Value of the `Server` header on responses generated by the proxy.
pub fn get_useragent() -> String {
    format!("sipswitch/{}", env!("CARGO_PKG_VERSION"))
}
