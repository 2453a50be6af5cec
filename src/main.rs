fn main() {
    edgechat_lib::run()
}
