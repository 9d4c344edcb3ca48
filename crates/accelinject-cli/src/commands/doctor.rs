use super::{EXIT_FAILURE, EXIT_SUCCESS};

pub fn run() -> Result<u8, String> {
    let missing = accelinject_runtime::check_prereqs();
    if missing.is_empty() {
        println!("all prerequisites satisfied");
        Ok(EXIT_SUCCESS)
    } else {
        println!("{}", accelinject_runtime::format_missing(&missing));
        Ok(EXIT_FAILURE)
    }
}
