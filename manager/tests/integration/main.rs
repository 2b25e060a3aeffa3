mod common;
mod test_api;
mod test_end_to_end;
