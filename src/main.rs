fn main() {
    signage_sync_lib::run()
}
